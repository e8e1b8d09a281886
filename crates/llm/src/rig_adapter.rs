use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rig::completion::{AssistantContent, CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::{ResultExt, ensure};
use tokio_util::sync::CancellationToken;

use super::backend::{
    BackendError, BackendOptions, BackendResult, BackendSettings, BoxFuture, CancelledSnafu,
    CompletionBackend, CompletionsFailedSnafu, HttpClientSnafu, InvalidRequestSnafu,
    MissingApiKeySnafu, ModelFetchStatusSnafu, string_option, u64_option,
};
use super::message::{
    Choice, CompletionRequest, CompletionResponse, Message, Role, Usage,
};
use super::mock::unix_timestamp_seconds;

pub const OPENAI_BACKEND_NAME: &str = "OpenAI";
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenAiConfig {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

/// Network backend speaking the OpenAI chat API through rig.
pub struct OpenAiBackend {
    config: ArcSwap<OpenAiConfig>,
}

impl OpenAiBackend {
    pub fn new(settings: BackendSettings) -> BackendResult<Self> {
        ensure!(
            !settings.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "openai-backend-new",
                backend: OPENAI_BACKEND_NAME.to_string(),
            }
        );

        Ok(Self {
            config: ArcSwap::from_pointee(OpenAiConfig {
                api_key: settings.api_key,
                base_url: settings.base_url,
                model: settings.model,
                timeout: settings.timeout,
                max_retries: settings.max_retries,
            }),
        })
    }

    pub fn default_model(&self) -> String {
        self.config.load().model.clone()
    }

    fn build_client(config: &OpenAiConfig) -> BackendResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    /// `GET /models` with a 2xx status.
    async fn probe_models(config: &OpenAiConfig) -> BackendResult<()> {
        let client = Self::build_client(config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| BackendError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;
        ModelFetchStatusSnafu {
            stage: "model-http-status",
            status: status.as_u16(),
            body,
        }
        .fail()
    }

    fn to_rig_message(message: &Message) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    // Rig exposes a single preamble field, so system-role messages are folded into it.
    fn merged_preamble(request: &CompletionRequest) -> Option<String> {
        let parts = request
            .messages
            .iter()
            .filter(|message| matches!(message.role, Role::System))
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| message.content.clone())
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    async fn send_completion(
        config: &OpenAiConfig,
        request: &CompletionRequest,
    ) -> BackendResult<CompletionResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model = %request.model,
                total_message_count = request.messages.len(),
                "no user/assistant messages remain after folding system messages"
            );
            return InvalidRequestSnafu {
                stage: "openai-complete-pop-prompt",
                details: "no user or assistant messages to send".to_string(),
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        if let Some(top_p) = request.top_p {
            builder = builder.additional_params(serde_json::json!({ "top_p": top_p }));
        }

        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "openai-complete-send",
        })?;

        let text = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<String>();

        // A reply without text becomes a response with no choices; callers decide what that means.
        let choices = if text.is_empty() {
            Vec::new()
        } else {
            vec![Choice {
                index: 0,
                message: Message::assistant(text),
                finish_reason: "stop".to_string(),
            }]
        };

        Ok(CompletionResponse {
            id: format!("chatcmpl-rig-{}", uuid::Uuid::now_v7().simple()),
            object: "chat.completion".to_string(),
            created: unix_timestamp_seconds(),
            model: request.model.clone(),
            choices,
            usage: Usage {
                prompt_tokens: response.usage.input_tokens,
                completion_tokens: response.usage.output_tokens,
                total_tokens: response.usage.total_tokens,
            },
        })
    }

    async fn complete_with_retries(
        &self,
        cancel: CancellationToken,
        mut request: CompletionRequest,
    ) -> BackendResult<CompletionResponse> {
        let config = self.config.load_full();
        if request.model.trim().is_empty() {
            request.model = config.model.clone();
        }
        request.validate()?;

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return CancelledSnafu { stage: "openai-complete-attempt" }.fail();
                }
                outcome = tokio::time::timeout(config.timeout, Self::send_completion(&config, &request)) => outcome,
            };

            let error = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(error)) => error,
                Err(_) => BackendError::RequestTimedOut {
                    stage: "openai-complete-attempt",
                    timeout_ms: config.timeout.as_millis() as u64,
                },
            };

            if attempt >= config.max_retries || !error.is_retryable() {
                return Err(error);
            }
            attempt += 1;

            tracing::warn!(
                model = %request.model,
                attempt,
                max_retries = config.max_retries,
                error = %error,
                "completion attempt failed; retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return CancelledSnafu { stage: "openai-complete-backoff" }.fail();
                }
                _ = tokio::time::sleep(RETRY_BACKOFF * attempt) => {}
            }
        }
    }
}

impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> String {
        OPENAI_BACKEND_NAME.to_string()
    }

    fn complete<'a>(
        &'a self,
        cancel: CancellationToken,
        request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>> {
        Box::pin(self.complete_with_retries(cancel, request))
    }

    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let config = self.config.load_full();
            match Self::probe_models(&config).await {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(
                        base_url = %config.base_url,
                        error = %error,
                        "availability probe failed"
                    );
                    false
                }
            }
        })
    }

    fn configure(&self, options: &BackendOptions) -> BackendResult<()> {
        let mut config = OpenAiConfig::clone(&self.config.load());

        if let Some(api_key) = string_option(options, "api_key", "openai-configure-api-key")?
            .filter(|value| !value.trim().is_empty())
        {
            config.api_key = api_key.trim().to_string();
        }
        if let Some(base_url) = string_option(options, "base_url", "openai-configure-base-url")?
            .filter(|value| !value.trim().is_empty())
        {
            config.base_url = base_url.trim().to_string();
        }
        if let Some(model) = string_option(options, "model", "openai-configure-model")?
            .filter(|value| !value.trim().is_empty())
        {
            config.model = model.trim().to_string();
        }
        if let Some(timeout_secs) =
            u64_option(options, "timeout_secs", "openai-configure-timeout")?.filter(|secs| *secs > 0)
        {
            config.timeout = Duration::from_secs(timeout_secs);
        }
        if let Some(max_retries) = u64_option(options, "max_retries", "openai-configure-retries")? {
            config.max_retries = u32::try_from(max_retries).unwrap_or(u32::MAX);
        }

        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "openai-configure-validate",
                backend: OPENAI_BACKEND_NAME.to_string(),
            }
        );

        self.config.store(Arc::new(config));
        Ok(())
    }
}
