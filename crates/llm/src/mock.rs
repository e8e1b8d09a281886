use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

use super::backend::{
    BackendOptions, BackendResult, BoxFuture, CancelledSnafu, CompletionBackend, string_option,
    u64_option,
};
use super::message::{
    Choice, CompletionRequest, CompletionResponse, Message, Usage, estimate_tokens,
};

pub const MOCK_BACKEND_NAME: &str = "MockAI";
pub const DEFAULT_MOCK_LATENCY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct MockState {
    name: String,
    latency: Duration,
    options: BackendOptions,
}

/// Deterministic test double: fixed latency, reply derived from the last message.
pub struct MockBackend {
    state: ArcSwap<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(MockState {
                name: MOCK_BACKEND_NAME.to_string(),
                latency: DEFAULT_MOCK_LATENCY,
                options: BackendOptions::new(),
            }),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        let mut state = MockState::clone(&self.state.load());
        state.latency = latency;
        self.state.store(Arc::new(state));
        self
    }

    pub fn latency(&self) -> Duration {
        self.state.load().latency
    }

    /// Every option applied so far, including ones the mock does not interpret.
    pub fn options(&self) -> BackendOptions {
        self.state.load().options.clone()
    }

    fn reply_for(messages: &[Message]) -> String {
        match messages.last() {
            Some(last) => format!(
                "Mock AI (OpenAI format) received: '{}'. This is a simulated response using Chat Completions API!",
                last.content
            ),
            None => {
                "Mock AI: Hello! I'm responding via the OpenAI Chat Completions format.".to_string()
            }
        }
    }

    fn build_response(request: &CompletionRequest) -> CompletionResponse {
        let content = Self::reply_for(&request.messages);
        let prompt_tokens = request
            .messages
            .iter()
            .map(|message| estimate_tokens(&message.content) as u64)
            .sum();
        let completion_tokens = estimate_tokens(&content) as u64;

        CompletionResponse {
            id: format!("chatcmpl-mock-{}", uuid::Uuid::now_v7().simple()),
            object: "chat.completion".to_string(),
            created: unix_timestamp_seconds(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::new(prompt_tokens, completion_tokens),
        }
    }
}

impl CompletionBackend for MockBackend {
    fn name(&self) -> String {
        self.state.load().name.clone()
    }

    fn complete<'a>(
        &'a self,
        cancel: CancellationToken,
        request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>> {
        Box::pin(async move {
            let latency = self.latency();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(backend = %self.name(), "mock completion cancelled");
                    return CancelledSnafu { stage: "mock-complete-wait" }.fail();
                }
                _ = tokio::time::sleep(latency) => {}
            }

            Ok(Self::build_response(&request))
        })
    }

    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    fn configure(&self, options: &BackendOptions) -> BackendResult<()> {
        let name = string_option(options, "name", "mock-configure-name")?;
        let latency_ms = u64_option(options, "latency_ms", "mock-configure-latency")?;

        let mut state = MockState::clone(&self.state.load());
        for (key, value) in options {
            state.options.insert(key.clone(), value.clone());
        }
        if let Some(name) = name {
            state.name = name.to_string();
        }
        if let Some(latency_ms) = latency_ms {
            state.latency = Duration::from_millis(latency_ms);
        }

        self.state.store(Arc::new(state));
        Ok(())
    }
}

pub(crate) fn unix_timestamp_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
