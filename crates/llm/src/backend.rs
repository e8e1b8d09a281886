use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use super::message::{CompletionRequest, CompletionResponse};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BackendResult<T> = Result<T, BackendError>;

/// Free-form backend options, keyed by option name.
pub type BackendOptions = serde_json::Map<String, Value>;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("invalid completion request on `{stage}`: {details}"))]
    InvalidRequest {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completion cancelled on `{stage}`"))]
    Cancelled { stage: &'static str },
    #[snafu(display("completion attempt timed out after {timeout_ms}ms on `{stage}`"))]
    RequestTimedOut { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("missing API key for backend '{backend}'"))]
    MissingApiKey {
        stage: &'static str,
        backend: String,
    },
    #[snafu(display("backend option '{key}' must be {expected}"))]
    InvalidOption {
        stage: &'static str,
        key: String,
        expected: &'static str,
    },
    #[snafu(display("backend '{backend}' is not supported"))]
    UnsupportedBackend {
        stage: &'static str,
        backend: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Transport-level failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimedOut { .. } | Self::HttpClient { .. } | Self::CompletionsFailed { .. }
        )
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidRequest { stage, .. }
            | Self::Cancelled { stage }
            | Self::RequestTimedOut { stage, .. }
            | Self::MissingApiKey { stage, .. }
            | Self::InvalidOption { stage, .. }
            | Self::UnsupportedBackend { stage, .. }
            | Self::HttpClient { stage, .. }
            | Self::BuildHttpRequestBody { stage, .. }
            | Self::ModelFetchStatus { stage, .. }
            | Self::CompletionsFailed { stage, .. } => stage,
        }
    }
}

/// Capability every completion backend offers to the chat controller.
///
/// Implementations are shared as `Arc<dyn CompletionBackend>` and must tolerate
/// concurrent calls. `configure` therefore takes `&self` and swaps settings
/// internally.
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> String;

    /// Produces a completion for the request. The token is the caller's
    /// cancellation signal; implementations stop waiting as soon as it fires.
    fn complete<'a>(
        &'a self,
        cancel: CancellationToken,
        request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>>;

    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool>;

    fn configure(&self, options: &BackendOptions) -> BackendResult<()>;
}

/// Backend variants known to [`create_backend`](crate::create_backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mock,
    #[serde(rename = "openai")]
    OpenAi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(raw: &str) -> BackendResult<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("mock") {
            Ok(Self::Mock)
        } else if raw.eq_ignore_ascii_case("openai") {
            Ok(Self::OpenAi)
        } else {
            UnsupportedBackendSnafu {
                stage: "parse-backend-kind",
                backend: raw.to_string(),
            }
            .fail()
        }
    }
}

/// Everything needed to build one backend instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl BackendSettings {
    pub fn mock() -> Self {
        Self {
            kind: BackendKind::Mock,
            api_key: String::new(),
            base_url: String::new(),
            model: String::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: 0,
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::OpenAi,
            api_key: api_key.into().trim().to_string(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into().trim().to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

pub(crate) fn string_option<'a>(
    options: &'a BackendOptions,
    key: &str,
    stage: &'static str,
) -> BackendResult<Option<&'a str>> {
    match options.get(key) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(_) => InvalidOptionSnafu {
            stage,
            key: key.to_string(),
            expected: "a string",
        }
        .fail(),
    }
}

pub(crate) fn u64_option(
    options: &BackendOptions,
    key: &str,
    stage: &'static str,
) -> BackendResult<Option<u64>> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| BackendError::InvalidOption {
            stage,
            key: key.to_string(),
            expected: "a non-negative integer",
        }),
    }
}
