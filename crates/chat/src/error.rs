use palaver_llm::BackendError;
use snafu::Snafu;

use super::ids::ConversationId;
use super::types::ChatResponse;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("conversation {id} not found"))]
    ConversationNotFound {
        stage: &'static str,
        id: ConversationId,
    },
    #[snafu(display("conversation id '{raw}' is invalid"))]
    InvalidConversationId {
        stage: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display(
        "no response choices returned for conversation {}",
        pending.conversation_id
    ))]
    EmptyCompletion {
        stage: &'static str,
        pending: Box<ChatResponse>,
    },
    #[snafu(display("backend failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        pending: Box<ChatResponse>,
        source: BackendError,
    },
    #[snafu(display(
        "request for conversation {} was cancelled or timed out",
        pending.conversation_id
    ))]
    CancelledOrTimedOut {
        stage: &'static str,
        pending: Box<ChatResponse>,
    },
    #[snafu(display(
        "conversation {} was deleted before its reply could be stored",
        pending.conversation_id
    ))]
    ConversationRemoved {
        stage: &'static str,
        pending: Box<ChatResponse>,
    },
    #[snafu(display("backend configuration rejected: {source}"))]
    Configuration {
        stage: &'static str,
        source: BackendError,
    },
}

impl ChatError {
    /// The user turn that was stored before dispatch failed, if any.
    pub fn pending_response(&self) -> Option<&ChatResponse> {
        match self {
            Self::EmptyCompletion { pending, .. }
            | Self::Backend { pending, .. }
            | Self::CancelledOrTimedOut { pending, .. }
            | Self::ConversationRemoved { pending, .. } => Some(pending.as_ref()),
            Self::ConversationNotFound { .. }
            | Self::InvalidConversationId { .. }
            | Self::Configuration { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ConversationNotFound { .. } | Self::ConversationRemoved { .. }
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
