mod error;
mod repl;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use palaver_chat::{Controller, DispatchContext};
use palaver_llm::BackendKind;
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

use crate::error::{CliResult, SettingsSnafu};
use crate::repl::Session;
use crate::settings::SettingsStore;

const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(
    name = "palaver",
    about = "Interactive multi-conversation chat over a pluggable completion backend"
)]
struct Cli {
    /// Config file path (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend to start with, overriding the configured default (mock, openai)
    #[arg(long)]
    backend: Option<String>,

    /// File holding the system prompt for new conversations
    #[arg(long)]
    system_prompt_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("palaver: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config_path = cli
        .config
        .unwrap_or_else(SettingsStore::default_config_path);
    let store = SettingsStore::open(config_path).context(SettingsSnafu {
        stage: "open-settings",
    })?;

    tracing::debug!(path = ?store.path(), "settings ready");

    let mut config = store.config().clone();
    if let Some(backend) = cli.backend {
        config.default.backend = backend;
    }
    config.validate().context(SettingsSnafu {
        stage: "validate-settings",
    })?;

    let kind = config.backend_kind().context(SettingsSnafu {
        stage: "resolve-backend-kind",
    })?;
    let mut backend = repl::build_backend(&config, kind)?;

    let probe = DispatchContext::with_timeout(STARTUP_PROBE_TIMEOUT);
    let available = tokio::select! {
        biased;
        _ = probe.done() => false,
        available = backend.is_available() => available,
    };
    if !available {
        tracing::warn!(backend = %backend.name(), "backend is not available");
        if kind != BackendKind::Mock {
            tracing::warn!("falling back to mock backend");
            backend = repl::build_backend(&config, BackendKind::Mock)?;
        }
    }

    let system_prompt = repl::load_system_prompt(cli.system_prompt_file.as_deref())?;
    let controller = Controller::new(backend, config.controller_config());
    let session = Session::start(controller, config, system_prompt).await;

    repl::run(session).await
}
