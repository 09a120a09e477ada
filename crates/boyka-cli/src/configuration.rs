use crate::error::{to_env_var, SettingsError};
use boyka::providers::configs::{
    AnthropicProviderConfig, BackendConfig, OpenAiProviderConfig, ProviderConfig,
    DEFAULT_ANTHROPIC_HOST, DEFAULT_ANTHROPIC_MODEL, DEFAULT_ANTHROPIC_VERSION, DEFAULT_MAX_TOKENS,
    DEFAULT_OPENAI_HOST, DEFAULT_OPENAI_MODEL, DEFAULT_TIMEOUT,
};
use boyka::providers::factory::ProviderType;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The single backend a session talks to, chosen by `type`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum BackendSettings {
    Anthropic {
        api_key: String,
        #[serde(default = "default_anthropic_host")]
        host: String,
        #[serde(default = "default_anthropic_model")]
        model: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_anthropic_version")]
        anthropic_version: String,
        #[serde(default = "default_timeout_secs")]
        connect_timeout_secs: u64,
        #[serde(default = "default_timeout_secs")]
        read_timeout_secs: u64,
        #[serde(default = "default_timeout_secs")]
        write_timeout_secs: u64,
    },
    OpenAi {
        api_key: String,
        #[serde(default = "default_openai_host")]
        host: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_timeout_secs")]
        connect_timeout_secs: u64,
        #[serde(default = "default_timeout_secs")]
        read_timeout_secs: u64,
        #[serde(default = "default_timeout_secs")]
        write_timeout_secs: u64,
    },
}

fn backend_config(
    api_key: String,
    host: String,
    model: String,
    max_tokens: u32,
    timeouts: [u64; 3],
) -> Result<BackendConfig, SettingsError> {
    let [connect, read, write] = timeouts;
    Ok(BackendConfig::builder()
        .api_key(api_key)
        .base_url(host)
        .model(model)
        .max_tokens(max_tokens)
        .connect_timeout(Duration::from_secs(connect))
        .read_timeout(Duration::from_secs(read))
        .write_timeout(Duration::from_secs(write))
        .build()?)
}

impl BackendSettings {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            BackendSettings::Anthropic { .. } => ProviderType::Anthropic,
            BackendSettings::OpenAi { .. } => ProviderType::OpenAi,
        }
    }

    // Convert to the library's ProviderConfig
    pub fn into_config(self) -> Result<ProviderConfig, SettingsError> {
        match self {
            BackendSettings::Anthropic {
                api_key,
                host,
                model,
                max_tokens,
                anthropic_version,
                connect_timeout_secs,
                read_timeout_secs,
                write_timeout_secs,
            } => {
                let backend = backend_config(
                    api_key,
                    host,
                    model,
                    max_tokens,
                    [connect_timeout_secs, read_timeout_secs, write_timeout_secs],
                )?;
                Ok(ProviderConfig::Anthropic(AnthropicProviderConfig {
                    backend,
                    anthropic_version,
                }))
            }
            BackendSettings::OpenAi {
                api_key,
                host,
                model,
                max_tokens,
                connect_timeout_secs,
                read_timeout_secs,
                write_timeout_secs,
            } => {
                let backend = backend_config(
                    api_key,
                    host,
                    model,
                    max_tokens,
                    [connect_timeout_secs, read_timeout_secs, write_timeout_secs],
                )?;
                Ok(ProviderConfig::OpenAi(OpenAiProviderConfig::new(backend)))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub backend: BackendSettings,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub stream: bool,
    /// Files whose contents are injected into the system prompt
    #[serde(default)]
    pub context_files: Vec<String>,
    /// A template file replacing the built-in system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Settings {
    /// Load from the TOML file at `path` (or the default location, if it
    /// exists) with `BOYKA_` environment variables layered on top.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::from(default_config_path())
                .format(FileFormat::Toml)
                .required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("BOYKA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("context_files"),
            )
            .build()?;

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    // "missing field `api_key`"
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .split('`')
                        .next()
                        .unwrap_or_default();
                    Err(SettingsError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(SettingsError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(SettingsError::Other(err))
                }
            }
        }
    }

    /// The workspace root with `~` and environment variables expanded
    pub fn workspace_path(&self) -> PathBuf {
        expand(&self.workspace)
    }
}

pub fn expand(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boyka")
        .join("config.toml")
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_anthropic_host() -> String {
    DEFAULT_ANTHROPIC_HOST.to_string()
}

fn default_anthropic_model() -> String {
    DEFAULT_ANTHROPIC_MODEL.to_string()
}

fn default_anthropic_version() -> String {
    DEFAULT_ANTHROPIC_VERSION.to_string()
}

fn default_openai_host() -> String {
    DEFAULT_OPENAI_HOST.to_string()
}

fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}
