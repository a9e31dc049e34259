//! TOML Configuration File Support
//!
//! Centralized configuration loading for taskrelay, from a TOML file at
//! `~/.config/taskrelay/taskrelay.toml` plus environment overrides.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Environment Variables
//!
//! | Variable                        | Field                         |
//! |---------------------------------|-------------------------------|
//! | `APP_MAX_EXECUTION_TIME`        | task budget, seconds          |
//! | `APP_MAX_ACTIVE_REQUESTS`       | global concurrency cap        |
//! | `APP_DAILY_RATE_LIMIT`          | daily quota per tenant        |
//! | `TASKRELAY_DAILY_LIMIT_ENABLED` | apply the daily quota at all  |
//! | `TASKRELAY_DEBUG`               | verbose failure logging       |
//!
//! # Example Configuration
//!
//! ```toml
//! debug = false
//!
//! [task]
//! max_execution_time_secs = 1200
//! poll_interval_ms = 1000
//! heartbeat_interval_secs = 10
//! owner_ttl_secs = 1800
//! stop_flag_ttl_secs = 600
//!
//! [limiter]
//! max_active_requests = 0
//! max_alive_secs = 600
//! reconcile_interval_secs = 300
//! record_ttl_secs = 86400
//!
//! [daily]
//! enabled = false
//! limit = 5000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelConfig;
use crate::limiter::LimiterConfig;
use crate::registry::RegistryConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Task section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskToml {
    /// Budget for a whole task in seconds
    pub max_execution_time_secs: Option<u64>,

    /// Drain poll granularity in milliseconds
    pub poll_interval_ms: Option<u64>,

    /// Seconds between heartbeats
    pub heartbeat_interval_secs: Option<u64>,

    /// Lifetime of ownership records in seconds
    pub owner_ttl_secs: Option<u64>,

    /// Lifetime of stop flags in seconds
    pub stop_flag_ttl_secs: Option<u64>,
}

/// Limiter section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterToml {
    /// Global concurrency cap per app (0 = unlimited)
    pub max_active_requests: Option<i64>,

    /// Lease staleness threshold in seconds
    pub max_alive_secs: Option<u64>,

    /// Seconds between reconciliations
    pub reconcile_interval_secs: Option<u64>,

    /// TTL of limiter records in seconds
    pub record_ttl_secs: Option<u64>,

    /// Store key prefix
    pub key_prefix: Option<String>,
}

/// Daily quota section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyToml {
    /// Whether quota-bound requests are counted
    pub enabled: Option<bool>,

    /// Requests per tenant per day
    pub limit: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRelayToml {
    /// Verbose failure logging
    pub debug: Option<bool>,

    /// Task configuration section
    pub task: TaskToml,

    /// Limiter configuration section
    pub limiter: LimiterToml,

    /// Daily quota configuration section
    pub daily: DailyToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for taskrelay
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct TaskRelayConfig {
    /// Task channel timing
    pub channel: ChannelConfig,

    /// Ownership and stop flag lifetimes
    pub registry: RegistryConfig,

    /// Concurrency limiter timing
    pub limiter: LimiterConfig,

    /// Global concurrency cap per app (0 = unlimited)
    pub max_active_requests: i64,

    /// Whether quota-bound requests are counted against the daily limit
    pub daily_limit_enabled: bool,

    /// Requests per tenant per day
    pub daily_limit: u64,

    /// Verbose failure logging
    pub debug: bool,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for TaskRelayConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            registry: RegistryConfig::default(),
            limiter: LimiterConfig::default(),
            max_active_requests: 0,
            daily_limit_enabled: false,
            daily_limit: 5000,
            debug: false,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl TaskRelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check that the timing values can drive a drain loop
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "task.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.channel.heartbeat_interval < Duration::from_secs(1) {
            return Err(ConfigError::ValidationError(
                "task.heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.channel.max_execution_time.is_zero() {
            return Err(ConfigError::ValidationError(
                "task.max_execution_time_secs must be positive".to_string(),
            ));
        }
        if self.limiter.max_alive_time.is_zero() {
            return Err(ConfigError::ValidationError(
                "limiter.max_alive_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/taskrelay/taskrelay.toml` or
/// `~/.config/taskrelay/taskrelay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("taskrelay").join("taskrelay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<TaskRelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the resulting values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<TaskRelayConfig, ConfigError> {
    load_with_env(path, |name| std::env::var(name).ok())
}

fn load_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<TaskRelayConfig, ConfigError> {
    let mut config = TaskRelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: TaskRelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut TaskRelayConfig, toml: &TaskRelayToml) {
    if let Some(debug) = toml.debug {
        config.debug = debug;
    }

    // Task settings
    if let Some(secs) = toml.task.max_execution_time_secs {
        config.channel.max_execution_time = Duration::from_secs(secs);
    }
    if let Some(ms) = toml.task.poll_interval_ms {
        config.channel.poll_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.task.heartbeat_interval_secs {
        config.channel.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.task.owner_ttl_secs {
        config.registry.owner_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.task.stop_flag_ttl_secs {
        config.registry.stop_flag_ttl = Duration::from_secs(secs);
    }

    // Limiter settings
    if let Some(max) = toml.limiter.max_active_requests {
        config.max_active_requests = max;
    }
    if let Some(secs) = toml.limiter.max_alive_secs {
        config.limiter.max_alive_time = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.limiter.reconcile_interval_secs {
        config.limiter.reconcile_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.limiter.record_ttl_secs {
        config.limiter.record_ttl = Duration::from_secs(secs);
    }
    if let Some(ref prefix) = toml.limiter.key_prefix {
        config.limiter.key_prefix.clone_from(prefix);
    }

    // Daily quota settings
    if let Some(enabled) = toml.daily.enabled {
        config.daily_limit_enabled = enabled;
    }
    if let Some(limit) = toml.daily.limit {
        config.daily_limit = limit;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut TaskRelayConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(secs) = env("APP_MAX_EXECUTION_TIME") {
        if let Ok(secs) = secs.parse::<u64>() {
            config.channel.max_execution_time = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(max) = env("APP_MAX_ACTIVE_REQUESTS") {
        if let Ok(max) = max.parse::<i64>() {
            config.max_active_requests = max;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(limit) = env("APP_DAILY_RATE_LIMIT") {
        if let Ok(limit) = limit.parse::<u64>() {
            config.daily_limit = limit;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(enabled) = env("TASKRELAY_DAILY_LIMIT_ENABLED") {
        config.daily_limit_enabled = parse_flag(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Some(debug) = env("TASKRELAY_DEBUG") {
        config.debug = parse_flag(&debug);
        config.source = ConfigSource::Env;
    }
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Debug logging override
    pub debug: Option<bool>,

    /// Global concurrency cap override
    pub max_active_requests: Option<i64>,

    /// Task budget override (seconds)
    pub max_execution_time_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set debug override
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Set concurrency cap override
    #[must_use]
    pub fn with_max_active_requests(mut self, max: i64) -> Self {
        self.max_active_requests = Some(max);
        self
    }

    /// Set task budget override
    #[must_use]
    pub fn with_max_execution_time_secs(mut self, secs: u64) -> Self {
        self.max_execution_time_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut TaskRelayConfig) {
        if self.debug.is_some()
            || self.max_active_requests.is_some()
            || self.max_execution_time_secs.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(debug) = self.debug {
            config.debug = debug;
        }
        if let Some(max) = self.max_active_requests {
            config.max_active_requests = max;
        }
        if let Some(secs) = self.max_execution_time_secs {
            config.channel.max_execution_time = Duration::from_secs(secs);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
