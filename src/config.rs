//! Configuration management for Tollgate.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `TOLLGATE__`-prefixed environment variables (`TOLLGATE__ENGINE__UNMATCHED=closed`).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{default_skip_paths, EngineOptions, FailMode};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Engine behavior
    #[serde(default)]
    pub engine: EngineConfig,

    /// State store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Policy source
    #[serde(default)]
    pub policies: PolicySourceConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Requests matching no policy: `open` admits, `closed` rejects
    #[serde(default)]
    pub unmatched: FailMode,

    /// State store outages: `open` admits with a warning, `closed` rejects
    #[serde(default)]
    pub store_failure: FailMode,

    /// Retry hint, in seconds, for requests refused by a `closed` switch
    #[serde(default = "default_closed_retry_after")]
    pub closed_retry_after_secs: u64,

    /// Path expressions exempt from rate limiting
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unmatched: FailMode::Open,
            store_failure: FailMode::Open,
            closed_retry_after_secs: default_closed_retry_after(),
            skip_paths: default_skip_paths(),
        }
    }
}

impl EngineConfig {
    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            unmatched: self.unmatched,
            closed_retry_after_secs: self.closed_retry_after_secs,
        }
    }
}

fn default_closed_retry_after() -> u64 {
    60
}

/// State store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Upper bound on tracked buckets; unbounded when absent
    #[serde(default)]
    pub max_entries: Option<usize>,
}

/// Policy source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySourceConfig {
    /// Path to the policy file
    #[serde(default)]
    pub path: Option<String>,

    /// Reload interval in seconds; 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for PolicySourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__"),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }
}
