use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Json, Serialized},
};
use palaver_chat::ControllerConfig;
use palaver_llm::{
    BackendError, BackendKind, BackendSettings, DEFAULT_MAX_RETRIES, DEFAULT_OPENAI_BASE_URL,
    DEFAULT_OPENAI_MODEL, DEFAULT_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "palaver";
pub const SETTINGS_FILE_NAME: &str = "config.json";

/// Environment variables that override single config keys.
const ENV_OVERRIDES: [(&str, &str); 4] = [
    ("OPENAI_API_KEY", "openai.api_key"),
    ("OPENAI_BASE_URL", "openai.base_url"),
    ("DEFAULT_BACKEND", "default.backend"),
    ("DEFAULT_MODEL", "default.model"),
];

const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiSection {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for OpenAiSection {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Backend and generation defaults used by the interactive session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultSection {
    pub backend: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for DefaultSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Mock.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            max_tokens: palaver_chat::DEFAULT_MAX_TOKENS,
            temperature: palaver_chat::DEFAULT_TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSection {
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            default_model: defaults.default_model,
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub openai: OpenAiSection,
    pub default: DefaultSection,
    pub chat_controller: ControllerSection,
}

impl AppConfig {
    pub fn backend_kind(&self) -> SettingsResult<BackendKind> {
        BackendKind::from_str(&self.default.backend).context(UnknownBackendSnafu {
            stage: "parse-default-backend",
        })
    }

    /// Checks that the configured backend is usable and generation defaults are in range.
    pub fn validate(&self) -> SettingsResult<()> {
        let kind = self.backend_kind()?;
        if kind == BackendKind::OpenAi && self.openai.api_key.trim().is_empty() {
            return NoUsableBackendSnafu {
                stage: "validate-backend",
                backend: kind.to_string(),
            }
            .fail();
        }

        let temperature = self.default.temperature;
        if !TEMPERATURE_RANGE.contains(&temperature) {
            return TemperatureOutOfRangeSnafu {
                stage: "validate-temperature",
                temperature,
            }
            .fail();
        }

        if self.default.max_tokens == 0 {
            return ZeroMaxTokensSnafu {
                stage: "validate-max-tokens",
            }
            .fail();
        }

        Ok(())
    }

    pub fn backend_settings(&self) -> SettingsResult<BackendSettings> {
        self.backend_settings_for(self.backend_kind()?)
    }

    pub fn backend_settings_for(&self, kind: BackendKind) -> SettingsResult<BackendSettings> {
        match kind {
            BackendKind::Mock => Ok(BackendSettings::mock()),
            BackendKind::OpenAi => {
                if self.openai.api_key.trim().is_empty() {
                    return NoUsableBackendSnafu {
                        stage: "build-openai-settings",
                        backend: kind.to_string(),
                    }
                    .fail();
                }
                Ok(BackendSettings::openai(&self.openai.api_key)
                    .with_base_url(&self.openai.base_url)
                    .with_model(&self.openai.model)
                    .with_timeout(Duration::from_secs(self.openai.timeout_secs))
                    .with_max_retries(self.openai.max_retries))
            }
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            default_model: self.chat_controller.default_model.clone(),
            max_tokens: self.chat_controller.max_tokens,
            temperature: self.chat_controller.temperature,
        }
    }
}

/// Config file handle. Missing files are seeded with defaults through a temp-file rename.
#[derive(Debug)]
pub struct SettingsStore {
    config: AppConfig,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".palaver"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn open(config_path: PathBuf) -> SettingsResult<Self> {
        Self::open_with(config_path, env_overrides())
    }

    /// Loads defaults, then the JSON file, then `overrides`.
    ///
    /// A missing file is created from the defaults first.
    pub fn open_with(config_path: PathBuf, overrides: impl Provider) -> SettingsResult<Self> {
        if !config_path.exists() {
            tracing::info!("settings file not found at {:?}, writing defaults", config_path);
            persist(&config_path, &AppConfig::default())?;
        }

        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Json::file(&config_path))
            .merge(overrides)
            .extract::<AppConfig>()
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: config_path.clone(),
            })?;

        tracing::info!("loaded settings from {:?}", config_path);
        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Maps the bare override variables onto their nested config keys.
///
/// Variables that are set but empty leave the file value in place.
pub fn env_overrides() -> Env {
    Env::raw()
        .filter(|key| {
            ENV_OVERRIDES.iter().any(|(variable, _)| {
                key.as_str().eq_ignore_ascii_case(variable)
                    && std::env::var(variable).is_ok_and(|value| !value.is_empty())
            })
        })
        .map(|key| {
            ENV_OVERRIDES
                .iter()
                .find(|(variable, _)| key.as_str().eq_ignore_ascii_case(variable))
                .map(|(_, path)| (*path).to_string())
                .unwrap_or_else(|| key.as_str().to_string())
                .into()
        })
}

fn persist(config_path: &Path, config: &AppConfig) -> SettingsResult<()> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-settings-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
        stage: "serialize-settings-json",
    })?;

    let temp_path = config_path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-settings-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, config_path).context(RenameTempFileSnafu {
        stage: "rename-temporary-settings-file",
        from: temp_path,
        to: config_path.to_path_buf(),
    })?;

    tracing::info!("saved settings to {:?}", config_path);
    Ok(())
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
    #[snafu(display("configured backend is not supported: {source}"))]
    UnknownBackend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display(
        "backend '{backend}' has no API key; set OPENAI_API_KEY or use the mock backend"
    ))]
    NoUsableBackend {
        stage: &'static str,
        backend: String,
    },
    #[snafu(display("temperature must be between 0.0 and 2.0, got {temperature}"))]
    TemperatureOutOfRange { stage: &'static str, temperature: f64 },
    #[snafu(display("max_tokens must be greater than 0"))]
    ZeroMaxTokens { stage: &'static str },
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    fn no_env() -> Env {
        Env::raw().only(&[])
    }

    #[test]
    fn first_open_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let store = SettingsStore::open_with(path.clone(), no_env()).unwrap();

        assert_eq!(store.config(), &AppConfig::default());
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let written: AppConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, AppConfig::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"default": {"backend": "openai", "temperature": 1.2}, "openai": {"api_key": "sk-file"}}"#,
        )
        .unwrap();

        let config = SettingsStore::open_with(path, no_env())
            .unwrap()
            .config()
            .clone();

        assert_eq!(config.default.backend, "openai");
        assert_eq!(config.default.temperature, 1.2);
        assert_eq!(config.default.max_tokens, 500);
        assert_eq!(config.openai.api_key, "sk-file");
        assert_eq!(config.openai.base_url, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(config.chat_controller, ControllerSection::default());
        config.validate().unwrap();
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        let error = SettingsStore::open_with(path, no_env()).unwrap_err();
        assert!(matches!(error, SettingsError::Extract { .. }));
    }

    #[test]
    fn environment_overrides_win() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{"default": {"backend": "mock", "model": "from-file"}}"#,
            )?;
            jail.set_env("OPENAI_API_KEY", "sk-env");
            jail.set_env("OPENAI_BASE_URL", "http://localhost:8080/v1");
            jail.set_env("DEFAULT_BACKEND", "openai");
            jail.set_env("DEFAULT_MODEL", "from-env");

            let store = SettingsStore::open(jail.directory().join(SETTINGS_FILE_NAME))
                .map_err(|error| error.to_string())?;
            let config = store.config();

            assert_eq!(config.openai.api_key, "sk-env");
            assert_eq!(config.openai.base_url, "http://localhost:8080/v1");
            assert_eq!(config.default.backend, "openai");
            assert_eq!(config.default.model, "from-env");
            Ok(())
        });
    }

    #[test]
    fn empty_environment_values_are_ignored() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{"openai": {"api_key": "sk-file"}, "default": {"model": "from-file"}}"#,
            )?;
            jail.set_env("OPENAI_API_KEY", "");
            jail.set_env("DEFAULT_BACKEND", "");
            jail.set_env("DEFAULT_MODEL", "from-env");

            let store = SettingsStore::open(jail.directory().join(SETTINGS_FILE_NAME))
                .map_err(|error| error.to_string())?;
            let config = store.config();

            assert_eq!(config.openai.api_key, "sk-file");
            assert_eq!(config.default.backend, "mock");
            assert_eq!(config.default.model, "from-env");
            Ok(())
        });
    }

    #[test]
    fn validation_rules() {
        let mut config = AppConfig::default();
        config.validate().unwrap();

        config.default.backend = "openai".to_string();
        assert!(matches!(
            config.validate(),
            Err(SettingsError::NoUsableBackend { .. })
        ));
        config.openai.api_key = "sk-test".to_string();
        config.validate().unwrap();

        config.default.temperature = 2.5;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::TemperatureOutOfRange { .. })
        ));
        config.default.temperature = 0.0;

        config.default.max_tokens = 0;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::ZeroMaxTokens { .. })
        ));

        config.default.max_tokens = 1;
        config.default.backend = "claude".to_string();
        assert!(matches!(
            config.validate(),
            Err(SettingsError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn conversions_carry_section_values() {
        let mut config = AppConfig::default();
        config.openai.api_key = "sk-test".to_string();
        config.openai.timeout_secs = 5;
        config.openai.max_retries = 1;
        config.chat_controller.default_model = "gpt-4o".to_string();
        config.chat_controller.max_tokens = 64;

        let openai = config.backend_settings_for(BackendKind::OpenAi).unwrap();
        assert_eq!(openai.kind, BackendKind::OpenAi);
        assert_eq!(openai.api_key, "sk-test");
        assert_eq!(openai.timeout, Duration::from_secs(5));
        assert_eq!(openai.max_retries, 1);

        assert_eq!(config.backend_settings().unwrap(), BackendSettings::mock());

        let controller = config.controller_config();
        assert_eq!(controller.default_model, "gpt-4o");
        assert_eq!(controller.max_tokens, 64);
        assert_eq!(controller.temperature, 0.7);
    }
}
