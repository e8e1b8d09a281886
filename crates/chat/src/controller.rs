use std::sync::Arc;

use arc_swap::ArcSwap;
use palaver_llm::{BackendOptions, CompletionRequest, Message, SharedBackend};
use snafu::ResultExt;

use super::dispatch::DispatchContext;
use super::error::{ChatError, ChatResult, ConfigurationSnafu};
use super::ids::ConversationId;
use super::store::ConversationStore;
use super::summary::{ConversationSummary, ControllerStats, StatsAccumulator};
use super::types::{ChatRequest, ChatResponse, ControllerConfig, Conversation};

const EMPTY_COMPLETION_MESSAGE: &str = "no response choices returned";
const CANCELLED_MESSAGE: &str = "request cancelled or timed out";

/// Generation parameters resolved once per dispatch.
#[derive(Debug, Clone, PartialEq)]
struct EffectiveParams {
    model: String,
    max_tokens: u32,
    temperature: f64,
}

/// Owns all conversations and drives request/response turns against the active backend.
pub struct Controller {
    store: ConversationStore,
    backend: ArcSwap<SharedBackend>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(backend: SharedBackend, config: ControllerConfig) -> Self {
        Self {
            store: ConversationStore::new(),
            backend: ArcSwap::from_pointee(backend),
            config,
        }
    }

    pub fn with_default_config(backend: SharedBackend) -> Self {
        Self::new(backend, ControllerConfig::default())
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub async fn create_conversation(&self, system_prompt: Option<&str>) -> Conversation {
        let conversation = self.store.create(system_prompt).await;
        tracing::debug!(conversation_id = %conversation.id, "conversation created");
        conversation
    }

    pub async fn get_conversation(&self, id: ConversationId) -> ChatResult<Conversation> {
        self.store.get(id).await
    }

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        self.store.list().await
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> ChatResult<()> {
        self.store.delete(id).await?;
        tracing::debug!(conversation_id = %id, "conversation deleted");
        Ok(())
    }

    /// Discards every non-system message.
    pub async fn clear_conversation(&self, id: ConversationId) -> ChatResult<()> {
        self.store.truncate_to_system(id).await
    }

    pub async fn set_metadata(
        &self,
        id: ConversationId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> ChatResult<()> {
        self.store.set_metadata(id, key.into(), value.into()).await
    }

    /// Runs one turn: store the user message, call the backend outside any lock,
    /// then store the first returned choice.
    ///
    /// A failed turn keeps the user message; the error carries a pending
    /// [`ChatResponse`] describing it.
    pub async fn send_message(
        &self,
        context: &DispatchContext,
        request: ChatRequest,
    ) -> ChatResult<ChatResponse> {
        let conversation_id = match request.conversation_id {
            Some(id) => id,
            None => {
                self.create_conversation(request.system_prompt.as_deref())
                    .await
                    .id
            }
        };

        let user_message = Message::user(request.message.clone());
        let snapshot = self
            .store
            .append_and_snapshot(conversation_id, user_message.clone())
            .await?;

        let params = self.resolve_params(&request);
        let backend = self.backend();
        let completion_request = CompletionRequest::new(params.model.clone(), snapshot)
            .with_max_tokens(params.max_tokens)
            .with_temperature(params.temperature);

        tracing::debug!(
            conversation_id = %conversation_id,
            backend = %backend.name(),
            model = %params.model,
            history_len = completion_request.messages.len(),
            "dispatching completion"
        );

        let backend_token = context.child_token();
        let outcome = tokio::select! {
            biased;
            _ = context.done() => None,
            result = backend.complete(backend_token.clone(), completion_request) => Some(result),
        };

        let response = match outcome {
            None => {
                backend_token.cancel();
                return Err(Self::cancelled(conversation_id, user_message, "await-completion"));
            }
            Some(Err(error)) if error.is_cancelled() => {
                return Err(Self::cancelled(conversation_id, user_message, "backend-cancelled"));
            }
            Some(Err(source)) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    backend = %backend.name(),
                    stage = source.stage(),
                    error = %source,
                    "completion failed; user message kept"
                );
                return Err(ChatError::Backend {
                    stage: "await-completion",
                    pending: ChatResponse::pending(
                        conversation_id,
                        user_message,
                        source.to_string(),
                    ),
                    source,
                });
            }
            Some(Ok(response)) => response,
        };

        let Some(assistant_message) = response.first_message().cloned() else {
            tracing::warn!(
                conversation_id = %conversation_id,
                backend = %backend.name(),
                "completion returned no choices; user message kept"
            );
            return Err(ChatError::EmptyCompletion {
                stage: "select-first-choice",
                pending: ChatResponse::pending(
                    conversation_id,
                    user_message,
                    EMPTY_COMPLETION_MESSAGE,
                ),
            });
        };

        if let Err(error) = self
            .store
            .append(conversation_id, assistant_message.clone())
            .await
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "conversation deleted while the completion was in flight; reply dropped"
            );
            let mut pending =
                ChatResponse::pending(conversation_id, user_message, error.to_string());
            pending.completion = Some(response);
            return Err(ChatError::ConversationRemoved {
                stage: "append-assistant-message",
                pending,
            });
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            completion_id = %response.id,
            total_tokens = response.usage.total_tokens,
            "completion stored"
        );

        Ok(ChatResponse {
            conversation_id,
            message: assistant_message,
            completion: Some(response),
            error: None,
        })
    }

    pub async fn summary(&self, id: ConversationId) -> ChatResult<ConversationSummary> {
        self.store
            .inspect(id, "summarize-conversation", ConversationSummary::from_conversation)
            .await
    }

    /// Best-effort aggregate taken under one shared read section.
    pub async fn stats(&self) -> ControllerStats {
        let backend_name = self.backend().name();
        self.store
            .fold(StatsAccumulator::default(), StatsAccumulator::add)
            .await
            .finish(backend_name)
    }

    /// Replaces the active backend. Dispatches already in flight keep the old one.
    pub fn set_backend(&self, backend: SharedBackend) {
        tracing::debug!(backend = %backend.name(), "switching backend");
        self.backend.store(Arc::new(backend));
    }

    pub fn backend(&self) -> SharedBackend {
        Arc::clone(&**self.backend.load())
    }

    /// Availability is advisory; `send_message` never consults it.
    pub async fn is_backend_available(&self, context: &DispatchContext) -> bool {
        let backend = self.backend();
        tokio::select! {
            biased;
            _ = context.done() => false,
            available = backend.is_available() => available,
        }
    }

    pub fn configure_backend(&self, options: &BackendOptions) -> ChatResult<()> {
        self.backend()
            .configure(options)
            .context(ConfigurationSnafu {
                stage: "configure-backend",
            })
    }

    fn resolve_params(&self, request: &ChatRequest) -> EffectiveParams {
        EffectiveParams {
            model: request
                .model
                .clone()
                .filter(|model| !model.is_empty())
                .unwrap_or_else(|| self.config.default_model.clone()),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
        }
    }

    fn cancelled(
        conversation_id: ConversationId,
        user_message: Message,
        stage: &'static str,
    ) -> ChatError {
        tracing::warn!(
            conversation_id = %conversation_id,
            stage,
            "dispatch cancelled or timed out; user message kept"
        );
        ChatError::CancelledOrTimedOut {
            stage,
            pending: ChatResponse::pending(conversation_id, user_message, CANCELLED_MESSAGE),
        }
    }
}
