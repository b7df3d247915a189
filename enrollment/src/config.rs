use crate::poll::PollPolicy;
use axum::http::HeaderValue;
use crm::ApiToken;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_CRM_BASE_URL: &str = "https://api.salesloft.com";
pub const DEFAULT_CUSTOM_FIELD_KEY: &str = "custom email template";

#[derive(Error, Debug)]
pub enum ConfigValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("CRM base URL must be an absolute http(s) URL: {0}")]
    InvalidBaseUrl(String),

    #[error("CRM timeout must be at least one second")]
    InvalidTimeout,

    #[error("Creation poll needs at least one attempt")]
    InvalidPollAttempts,

    #[error("Custom field key cannot be empty")]
    EmptyCustomFieldKey,

    #[error("Invalid CORS origin: {0}")]
    InvalidOrigin(String),

    #[error("Diagnostic log body limit cannot be 0")]
    InvalidBodyLimit,
}

/// Enrollment service configuration
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener for the public API
    pub listener: Listener,
    /// Upstream CRM settings
    pub crm: CrmConfig,
    /// How long to wait for a contact whose creation the CRM queued (HTTP 202)
    pub creation_poll: CreationPollConfig,
    pub cors: CorsConfig,
    /// Optional append-only journal of every CRM call
    pub diagnostic_log: Option<DiagnosticLogConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.listener.validate()?;
        self.crm.validate()?;

        if self.creation_poll.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidPollAttempts);
        }

        for origin in &self.cors.allow_origins {
            if HeaderValue::from_str(origin).is_err() || origin.trim().is_empty() {
                return Err(ConfigValidationError::InvalidOrigin(origin.clone()));
            }
        }

        if let Some(log) = &self.diagnostic_log
            && log.max_body_chars == 0
        {
            return Err(ConfigValidationError::InvalidBodyLimit);
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.port == 0 {
            return Err(ConfigValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrmConfig {
    /// Base URL of the CRM API, without the `/v2` prefix
    pub base_url: String,
    /// Default credential. Requests may override it with the API key header.
    pub api_key: Option<ApiToken>,
    /// Timeout applied to every upstream call
    pub timeout_secs: u64,
    /// Custom field the free-text memo is stored under
    pub custom_field_key: String,
}

impl Default for CrmConfig {
    fn default() -> Self {
        CrmConfig {
            base_url: DEFAULT_CRM_BASE_URL.into(),
            api_key: None,
            timeout_secs: 15,
            custom_field_key: DEFAULT_CUSTOM_FIELD_KEY.into(),
        }
    }
}

impl CrmConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.base_url()?;
        if self.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidTimeout);
        }
        if self.custom_field_key.trim().is_empty() {
            return Err(ConfigValidationError::EmptyCustomFieldKey);
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigValidationError> {
        match Url::parse(&self.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(url),
            _ => Err(ConfigValidationError::InvalidBaseUrl(self.base_url.clone())),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CreationPollConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for CreationPollConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        CreationPollConfig {
            max_attempts: policy.max_attempts,
            delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

impl CreationPollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}

/// An empty origin list allows any origin.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DiagnosticLogConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
}

fn default_max_body_chars() -> usize {
    2000
}
