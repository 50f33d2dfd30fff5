//! Configuration management for the Relay sync engine.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/relay/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("lease_ms must be between 1000 and 600000, got {0}")]
    InvalidLease(u64),

    #[error("acquire_timeout_ms must be between 1 and 600000, got {0}")]
    InvalidAcquireTimeout(u64),

    #[error("retry_interval_ms must be between 1 and acquire_timeout_ms, got {0}")]
    InvalidRetryInterval(u64),

    #[error("debounce_ms must be at most 60000, got {0}")]
    InvalidDebounce(u64),

    #[error("rate limit '{class}' is invalid: {reason}")]
    InvalidRateLimit { class: &'static str, reason: String },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("mode must be 'production' or 'development', got {0}")]
    InvalidMode(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Data root and logging.
    pub storage: StorageConfig,

    /// Cross-process lock tuning.
    pub locks: LockConfig,

    /// External change detection.
    pub watcher: WatcherConfig,

    /// Per-operation-class token buckets.
    pub rate_limits: RateLimitConfig,

    /// Build mode guards.
    pub runtime: RuntimeConfig,
}

/// Data root and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the collection files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Unset logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

/// Lock lease and acquisition configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// How long a lock stays valid without release before it may be reclaimed.
    pub lease_ms: u64,

    /// How long to wait for a contended lock before failing the write.
    pub acquire_timeout_ms: u64,

    /// Delay between attempts while waiting for a contended lock.
    pub retry_interval_ms: u64,
}

/// File watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Whether to watch the data root for external edits.
    pub enabled: bool,

    /// Quiet period before a burst of changes is reported.
    pub debounce_ms: u64,
}

/// One token bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    /// Maximum burst size.
    pub capacity: f64,

    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    /// Create a bucket configuration.
    pub const fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

/// Token buckets for each operation class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bulk imports: small burst, slow refill.
    pub import: BucketConfig,

    /// Record mutations: generous burst, fast refill.
    pub mutation: BucketConfig,

    /// Manual reloads.
    pub reload: BucketConfig,

    /// Opening files chosen by the user.
    pub fs_open: BucketConfig,
}

/// Build mode of the running application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Shipping build; development-only operations are refused.
    Production,
    /// Developer build.
    Development,
}

impl BuildMode {
    /// Parse a mode name.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            _ => Err(ConfigError::InvalidMode(value.to_string())),
        }
    }

    /// The most permissive mode this binary may run in.
    ///
    /// Release builds are always production, whatever the configuration
    /// or environment says.
    pub fn build_ceiling() -> Self {
        if cfg!(debug_assertions) {
            Self::Development
        } else {
            Self::Production
        }
    }

    /// Lower `self` to what this build allows.
    pub fn clamp_to_build(self) -> Self {
        match Self::build_ceiling() {
            Self::Development => self,
            Self::Production => Self::Production,
        }
    }
}

/// One environment variable seen by [`Config::apply_env_overrides`].
///
/// Overrides are applied before logging is installed, so the caller logs
/// them once the subscriber is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// The variable replaced a configuration value.
    Applied { var: &'static str, value: String },
    /// The variable was set but left the configuration unchanged.
    Ignored { var: &'static str, reason: String },
}

impl EnvOverride {
    /// Log this override at info, or warn when it was ignored.
    pub fn log(&self) {
        match self {
            Self::Applied { var, value } => {
                tracing::info!(
                    var = *var,
                    value = %value,
                    "Configuration overridden from environment"
                );
            }
            Self::Ignored { var, reason } => {
                tracing::warn!(var = *var, "Ignoring environment override: {}", reason);
            }
        }
    }
}

/// Runtime guards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Build mode. Defaults to development for debug builds.
    pub mode: BuildMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: 10_000,
            acquire_timeout_ms: 5_000,
            retry_interval_ms: 50,
        }
    }
}

impl LockConfig {
    /// Lock lease as a duration.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Acquire timeout as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Retry interval as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 250,
        }
    }
}

impl WatcherConfig {
    /// Debounce window as a duration.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            import: BucketConfig::new(5.0, 0.1),
            mutation: BucketConfig::new(30.0, 10.0),
            reload: BucketConfig::new(5.0, 1.0),
            fs_open: BucketConfig::new(10.0, 2.0),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: BuildMode::build_ceiling(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay")
        .join("data")
}

fn validate_bucket(class: &'static str, bucket: &BucketConfig) -> Result<(), ConfigError> {
    if !bucket.capacity.is_finite() || bucket.capacity < 1.0 {
        return Err(ConfigError::InvalidRateLimit {
            class,
            reason: format!("capacity must be at least 1, got {}", bucket.capacity),
        });
    }
    if !bucket.refill_per_sec.is_finite() || bucket.refill_per_sec <= 0.0 {
        return Err(ConfigError::InvalidRateLimit {
            class,
            reason: format!(
                "refill_per_sec must be greater than 0, got {}",
                bucket.refill_per_sec
            ),
        });
    }
    Ok(())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - RELAY_DATA_DIR: Override the data root
    /// - RELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - RELAY_MODE: Lower the build mode to production. A production
    ///   configuration is never raised to development.
    ///
    /// Returns every variable that was set, for logging once tracing is up.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut seen = Vec::new();

        if let Ok(dir) = std::env::var("RELAY_DATA_DIR") {
            if !dir.is_empty() {
                self.storage.data_dir = PathBuf::from(&dir);
                seen.push(EnvOverride::Applied {
                    var: "RELAY_DATA_DIR",
                    value: dir,
                });
            }
        }

        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            if !level.is_empty() {
                self.storage.log_level = level.clone();
                seen.push(EnvOverride::Applied {
                    var: "RELAY_LOG_LEVEL",
                    value: level,
                });
            }
        }

        if let Ok(value) = std::env::var("RELAY_MODE") {
            match BuildMode::parse(&value) {
                Ok(BuildMode::Development) if self.runtime.mode == BuildMode::Production => {
                    seen.push(EnvOverride::Ignored {
                        var: "RELAY_MODE",
                        reason: "production mode cannot be raised to development".to_string(),
                    });
                }
                Ok(mode) => {
                    self.runtime.mode = mode;
                    seen.push(EnvOverride::Applied {
                        var: "RELAY_MODE",
                        value,
                    });
                }
                Err(e) if !value.is_empty() => {
                    seen.push(EnvOverride::Ignored {
                        var: "RELAY_MODE",
                        reason: e.to_string(),
                    });
                }
                Err(_) => {}
            }
        }

        seen
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let locks = &self.locks;
        if !(1_000..=600_000).contains(&locks.lease_ms) {
            return Err(ConfigError::InvalidLease(locks.lease_ms));
        }
        if !(1..=600_000).contains(&locks.acquire_timeout_ms) {
            return Err(ConfigError::InvalidAcquireTimeout(locks.acquire_timeout_ms));
        }
        if locks.retry_interval_ms == 0 || locks.retry_interval_ms > locks.acquire_timeout_ms {
            return Err(ConfigError::InvalidRetryInterval(locks.retry_interval_ms));
        }

        if self.watcher.debounce_ms > 60_000 {
            return Err(ConfigError::InvalidDebounce(self.watcher.debounce_ms));
        }

        validate_bucket("import", &self.rate_limits.import)?;
        validate_bucket("mutation", &self.rate_limits.mutation)?;
        validate_bucket("reload", &self.rate_limits.reload)?;
        validate_bucket("fs_open", &self.rate_limits.fs_open)?;

        let level = self.storage.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.storage.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
