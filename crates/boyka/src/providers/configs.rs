use std::fmt;
use std::time::Duration;

use crate::errors::ConfigError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20240620";
pub const DEFAULT_OPENAI_HOST: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// Connection settings shared by every backend.
///
/// Only obtainable through [`BackendConfigBuilder::build`], so a value of this
/// type always has an API key and a base URL.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl BackendConfig {
    pub fn builder() -> BackendConfigBuilder {
        BackendConfigBuilder::default()
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// `base_url` joined with `path`, tolerating slashes on either side.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct BackendConfigBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl BackendConfigBuilder {
    pub fn api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Validate and freeze the settings. The model falls back to `default_model`.
    pub fn build_with_default_model(
        self,
        default_model: &str,
    ) -> Result<BackendConfig, ConfigError> {
        let api_key = non_blank(self.api_key).ok_or(ConfigError::Missing("api_key"))?;
        let base_url = non_blank(self.base_url).ok_or(ConfigError::Missing("base_url"))?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "base_url",
                reason: format!("'{}' is not an http(s) URL", base_url),
            });
        }

        let max_tokens = self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if max_tokens == 0 {
            return Err(ConfigError::Invalid {
                field: "max_tokens",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(BackendConfig {
            api_key,
            base_url,
            model: non_blank(self.model).unwrap_or_else(|| default_model.to_string()),
            max_tokens,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_TIMEOUT),
            read_timeout: self.read_timeout.unwrap_or(DEFAULT_TIMEOUT),
            write_timeout: self.write_timeout.unwrap_or(DEFAULT_TIMEOUT),
        })
    }

    pub fn build(self) -> Result<BackendConfig, ConfigError> {
        let model = self.model.clone();
        if non_blank(model).is_none() {
            return Err(ConfigError::Missing("model"));
        }
        self.build_with_default_model("")
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct AnthropicProviderConfig {
    pub backend: BackendConfig,
    pub anthropic_version: String,
}

impl AnthropicProviderConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub backend: BackendConfig,
}

impl OpenAiProviderConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self { backend }
    }
}

/// The one backend a conversation talks to.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Anthropic(AnthropicProviderConfig),
    OpenAi(OpenAiProviderConfig),
}

impl ProviderConfig {
    pub fn backend(&self) -> &BackendConfig {
        match self {
            ProviderConfig::Anthropic(config) => &config.backend,
            ProviderConfig::OpenAi(config) => &config.backend,
        }
    }
}
