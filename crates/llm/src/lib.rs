use std::sync::Arc;

mod backend;
mod message;
mod mock;
mod rig_adapter;

pub use backend::{
    BackendError, BackendKind, BackendOptions, BackendResult, BackendSettings, BoxFuture,
    CompletionBackend, DEFAULT_MAX_RETRIES, DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL,
    DEFAULT_TIMEOUT,
};
pub use message::{
    Choice, CompletionRequest, CompletionResponse, Message, Role, TOKEN_ESTIMATE_DIVISOR, Usage,
    estimate_tokens,
};
pub use mock::{DEFAULT_MOCK_LATENCY, MOCK_BACKEND_NAME, MockBackend};
pub use rig_adapter::{OPENAI_BACKEND_NAME, OpenAiBackend};

/// Shared handle to whichever backend is active.
pub type SharedBackend = Arc<dyn CompletionBackend>;

pub fn create_backend(settings: BackendSettings) -> BackendResult<SharedBackend> {
    match settings.kind {
        BackendKind::Mock => Ok(Arc::new(MockBackend::new())),
        BackendKind::OpenAi => {
            let mut settings = settings;
            if settings.base_url.is_empty() {
                settings.base_url = DEFAULT_OPENAI_BASE_URL.to_string();
            }
            if settings.model.is_empty() {
                settings.model = DEFAULT_OPENAI_MODEL.to_string();
            }
            Ok(Arc::new(OpenAiBackend::new(settings)?))
        }
    }
}
