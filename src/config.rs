//! Configuration management for Docpacer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dispatch::{DispatcherConfig, DEFAULT_SUCCESS_STATUS};
use crate::error::{DocpacerError, Result};
use crate::ratelimit::{RateLimitConfig, TimeUnit};
use crate::transport::{HttpTransportConfig, DEFAULT_DOCUMENT_URL};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "DOCPACER";

/// Main configuration for the Docpacer client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocpacerConfig {
    /// Request pacing
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Remote endpoint
    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Rate limit section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests allowed per `unit`
    #[serde(default = "default_requests_per_unit")]
    pub requests_per_unit: u32,

    #[serde(default = "default_unit")]
    pub unit: TimeUnit,

    /// Explicit window length; replaces `unit` when set
    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_unit: default_requests_per_unit(),
            unit: default_unit(),
            window_ms: None,
        }
    }
}

fn default_requests_per_unit() -> u32 {
    10
}

fn default_unit() -> TimeUnit {
    TimeUnit::Second
}

impl RateLimitSettings {
    /// Validate the section into a [`RateLimitConfig`].
    pub fn to_rate_limit_config(&self) -> Result<RateLimitConfig> {
        match self.window_ms {
            Some(ms) => RateLimitConfig::new(Duration::from_millis(ms), self.requests_per_unit),
            None => RateLimitConfig::per_unit(self.unit, self.requests_per_unit),
        }
    }
}

/// Transport section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_url")]
    pub url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// The only status treated as a successful delivery
    #[serde(default = "default_success_status")]
    pub success_status: u16,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout_ms: default_timeout_ms(),
            success_status: default_success_status(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_DOCUMENT_URL.to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_success_status() -> u16 {
    DEFAULT_SUCCESS_STATUS
}

impl TransportSettings {
    /// Validate the section into an [`HttpTransportConfig`].
    pub fn to_http_config(&self) -> Result<HttpTransportConfig> {
        if self.timeout_ms == 0 {
            return Err(DocpacerError::Config(
                "transport timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(HttpTransportConfig {
            url: self.url.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }
}

/// Logging section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `info` or `docpacer=debug`
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl DocpacerConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| DocpacerError::Config(e.to_string()))
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load an optional YAML file layered under `DOCPACER__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::new(path, ::config::FileFormat::Yaml).required(true),
            );
        }
        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| DocpacerError::Config(e.to_string()))
    }

    /// Build the dispatcher settings, validating the rate limit.
    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        let rate_limit = self.rate_limit.to_rate_limit_config()?;
        Ok(DispatcherConfig::new(rate_limit).with_success_status(self.transport.success_status))
    }
}
