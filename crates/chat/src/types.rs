use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use palaver_llm::{CompletionResponse, DEFAULT_OPENAI_MODEL, Message, Role};
use serde::{Deserialize, Serialize};

use super::ids::ConversationId;

pub const DEFAULT_MAX_TOKENS: u32 = 500;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Ordered message log plus metadata.
///
/// History only grows, except through [`Conversation::truncate_to_system`].
/// `updated_at` never precedes `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl Conversation {
    pub(crate) fn new(id: ConversationId, system_prompt: Option<&str>) -> Self {
        let now = Utc::now();
        let messages = system_prompt
            .filter(|prompt| !prompt.is_empty())
            .map(|prompt| vec![Message::system(prompt)])
            .unwrap_or_default();

        Self {
            id,
            messages,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    /// Drops every non-system message.
    pub(crate) fn truncate_to_system(&mut self) {
        self.messages.retain(|message| message.role == Role::System);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
    }

    pub fn last_message_by_role(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|message| message.role == role)
    }
}

/// One caller turn. Unset overrides fall back to the controller defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<ConversationId>,
    pub message: String,
    /// Seeds a new conversation; ignored when `conversation_id` is set.
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Result view of one turn.
///
/// On success `message` is the assistant reply. When dispatch fails the view is
/// carried by the error instead, with `message` set to the stored user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: ConversationId,
    pub message: Message,
    pub completion: Option<CompletionResponse>,
    pub error: Option<String>,
}

impl ChatResponse {
    pub(crate) fn pending(
        conversation_id: ConversationId,
        user_message: Message,
        error: impl Into<String>,
    ) -> Box<Self> {
        Box::new(Self {
            conversation_id,
            message: user_message,
            completion: None,
            error: Some(error.into()),
        })
    }
}

/// Defaults applied when a request leaves a generation parameter unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_OPENAI_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}
