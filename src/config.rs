//! Client configuration: an immutable snapshot shared by every component.

use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pagination::{PaginationSettings, PaginationStrategy};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECONDS: f64 = 1.0;
pub const DEFAULT_BACKOFF_CEILING_SECONDS: f64 = 10.0;
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 10.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unsupported config option: {0}")]
    Unsupported(String),
}

/// Authentication selector plus credentials.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSettings {
    #[default]
    None,
    ApiKey {
        key: String,
        /// Header carrying the key. Ignored when `query_param` is set.
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        query_param: Option<String>,
    },
    Basic {
        username: String,
        password: String,
    },
    Token {
        token: String,
        #[serde(default = "default_token_header")]
        header_name: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    Bearer {
        token: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        token_url: String,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        client_secret: Option<String>,
        #[serde(default)]
        expires_in_seconds: Option<u64>,
    },
}

fn default_token_header() -> String {
    "Authorization".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_seconds: f64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: Option<f64>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub pagination: PaginationSettings,
    #[serde(default = "default_true")]
    pub retry_idempotent_only: bool,
    /// Recognized so that configs carrying it fail loudly; client-side
    /// rate limiting is not implemented.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_base() -> f64 {
    DEFAULT_BACKOFF_BASE_SECONDS
}

fn default_backoff_ceiling() -> f64 {
    DEFAULT_BACKOFF_CEILING_SECONDS
}

fn default_timeout() -> Option<f64> {
    Some(DEFAULT_TIMEOUT_SECONDS)
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("wedgie/{}", env!("CARGO_PKG_VERSION"))
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: BTreeMap::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_seconds: DEFAULT_BACKOFF_BASE_SECONDS,
            backoff_ceiling_seconds: DEFAULT_BACKOFF_CEILING_SECONDS,
            timeout_seconds: Some(DEFAULT_TIMEOUT_SECONDS),
            verify_ssl: true,
            user_agent: default_user_agent(),
            auth: AuthSettings::None,
            pagination: PaginationSettings::default(),
            retry_idempotent_only: true,
            requests_per_minute: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_seconds: f64, ceiling_seconds: f64) -> Self {
        self.backoff_base_seconds = base_seconds;
        self.backoff_ceiling_seconds = ceiling_seconds;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: Option<f64>) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_auth(mut self, auth: AuthSettings) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationSettings) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry_idempotent_only(mut self, only: bool) -> Self {
        self.retry_idempotent_only = only;
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// `<config dir>/wedgie/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wedgie").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_base_url()?;

        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if seconds(self.backoff_base_seconds).is_none() {
            return Err(ConfigError::Invalid(
                "backoff_base_seconds must be a non-negative number of seconds".into(),
            ));
        }
        if seconds(self.backoff_ceiling_seconds).is_none()
            || self.backoff_ceiling_seconds < self.backoff_base_seconds
        {
            return Err(ConfigError::Invalid(
                "backoff_ceiling_seconds must be at least backoff_base_seconds".into(),
            ));
        }
        if let Some(timeout) = self.timeout_seconds {
            if seconds(timeout).is_none() || timeout <= 0.0 {
                return Err(ConfigError::Invalid("timeout_seconds must be positive".into()));
            }
        }
        if self.requests_per_minute.is_some() {
            return Err(ConfigError::Unsupported(
                "requests_per_minute: client-side rate limiting is not implemented".into(),
            ));
        }
        if let PaginationStrategy::PageNumber { page_size, .. } = self.pagination.strategy {
            if page_size == 0 {
                return Err(ConfigError::Invalid("pagination page_size must be at least 1".into()));
            }
        }
        if self.pagination.max_pages == 0 {
            return Err(ConfigError::Invalid("pagination max_pages must be at least 1".into()));
        }
        self.header_map()?;
        Ok(())
    }

    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("base_url '{}': {}", self.base_url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::Invalid(format!(
                "base_url scheme must be http or https, got '{}'",
                other
            ))),
        }
    }

    pub fn header_map(&self) -> Result<HeaderMap, ConfigError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError::Invalid(format!("header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConfigError::Invalid(format!("header '{}': {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Out-of-range values saturate; `validate` rejects them.
    pub fn backoff_base(&self) -> Duration {
        seconds(self.backoff_base_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        seconds(self.backoff_ceiling_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|t| *t > 0.0)
            .and_then(seconds)
    }
}

/// `None` for negative, non-finite or unrepresentable values.
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}
