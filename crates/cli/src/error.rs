use std::path::PathBuf;

use palaver_llm::BackendError;
use snafu::Snafu;

use crate::settings::SettingsError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to build backend on `{stage}`: {source}"))]
    BuildBackend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("failed to read system prompt from {path:?}: {source}"))]
    ReadSystemPrompt {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}
