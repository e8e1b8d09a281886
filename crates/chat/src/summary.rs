use chrono::{DateTime, Utc};
use palaver_llm::{Role, estimate_tokens};
use serde::{Deserialize, Serialize};

use super::ids::ConversationId;
use super::types::Conversation;

/// Derived view of one conversation. Recomputed on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub message_count: usize,
    pub system_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    /// `ceil(chars / 4)` per message; an approximation, not a tokenizer count.
    pub estimated_tokens: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_system_message: Option<String>,
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
}

impl ConversationSummary {
    pub fn from_conversation(conversation: &Conversation) -> Self {
        let count = |role: Role| {
            conversation
                .messages
                .iter()
                .filter(|message| message.role == role)
                .count()
        };
        let last = |role: Role| {
            conversation
                .last_message_by_role(role)
                .map(|message| message.content.clone())
        };

        Self {
            id: conversation.id,
            message_count: conversation.messages.len(),
            system_messages: count(Role::System),
            user_messages: count(Role::User),
            assistant_messages: count(Role::Assistant),
            estimated_tokens: conversation
                .messages
                .iter()
                .map(|message| estimate_tokens(&message.content))
                .sum(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            last_system_message: last(Role::System),
            last_user_message: last(Role::User),
            last_assistant_message: last(Role::Assistant),
        }
    }
}

/// Point-in-time aggregate over every live conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub backend_name: String,
    /// Earliest `created_at`; `None` without conversations.
    pub oldest_conversation: Option<DateTime<Utc>>,
    /// Latest `updated_at`; `None` without conversations.
    pub newest_conversation: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct StatsAccumulator {
    total_conversations: usize,
    total_messages: usize,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
}

impl StatsAccumulator {
    pub(crate) fn add(mut self, conversation: &Conversation) -> Self {
        self.total_conversations += 1;
        self.total_messages += conversation.messages.len();
        self.oldest = Some(
            self.oldest
                .map_or(conversation.created_at, |oldest| oldest.min(conversation.created_at)),
        );
        self.newest = Some(
            self.newest
                .map_or(conversation.updated_at, |newest| newest.max(conversation.updated_at)),
        );
        self
    }

    pub(crate) fn finish(self, backend_name: String) -> ControllerStats {
        ControllerStats {
            total_conversations: self.total_conversations,
            total_messages: self.total_messages,
            backend_name,
            oldest_conversation: self.oldest,
            newest_conversation: self.newest,
        }
    }
}
