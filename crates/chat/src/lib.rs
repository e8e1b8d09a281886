//! Conversation store and the controller that drives turns against a completion backend.

mod controller;
mod dispatch;
mod error;
mod ids;
mod store;
mod summary;
mod types;

pub use controller::Controller;
pub use dispatch::DispatchContext;
pub use error::{ChatError, ChatResult};
pub use ids::ConversationId;
pub use store::ConversationStore;
pub use summary::{ControllerStats, ConversationSummary};
pub use types::{
    ChatRequest, ChatResponse, ControllerConfig, Conversation, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE,
};
