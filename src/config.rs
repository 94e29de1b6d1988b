//! Configuration module for modelwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max parallel checks must be at least 1")]
    NoConcurrency,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "modelwatch.db")
    pub db_path: String,
    /// Probe interval used when a provider has no override (default: 300s)
    pub check_interval_secs: u64,
    /// Request timeout used when a provider has no override (default: 120s)
    pub check_timeout_secs: u64,
    /// Maximum number of probes in flight at once (default: 3)
    pub max_parallel_checks: usize,
    /// Probe history older than this many days is purged (default: 30)
    pub retention_days: u32,
    /// How often the retention cleaner runs (default: 3600s)
    pub cleanup_interval_secs: u64,
    /// Upper bound between two registry re-reads (default: 15s)
    pub registry_refresh_secs: u64,
    /// Spread of the first due time of a newly seen target (default: 1000ms)
    pub startup_jitter_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "modelwatch.db".to_string(),
            check_interval_secs: 300,
            check_timeout_secs: 120,
            max_parallel_checks: 3,
            retention_days: 30,
            cleanup_interval_secs: 3600,
            registry_refresh_secs: 15,
            startup_jitter_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MODELWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `MODELWATCH_DB_PATH`: Database file path (default: "modelwatch.db")
    /// - `MODELWATCH_CHECK_INTERVAL_SECS`: default probe interval (default: 300)
    /// - `MODELWATCH_CHECK_TIMEOUT_SECS`: default request timeout (default: 120)
    /// - `MODELWATCH_MAX_PARALLEL_CHECKS`: concurrency ceiling (default: 3)
    /// - `MODELWATCH_RETENTION_DAYS`: history horizon in days (default: 30)
    /// - `MODELWATCH_CLEANUP_INTERVAL_SECS`: cleaner cadence (default: 3600)
    /// - `MODELWATCH_REGISTRY_REFRESH_SECS`: registry re-read bound (default: 15)
    /// - `MODELWATCH_STARTUP_JITTER_MS`: first-run spread (default: 1000)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        override_from_env("MODELWATCH_HTTP_PORT", &mut cfg.http_port);
        if let Ok(db_path) = env::var("MODELWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        override_from_env("MODELWATCH_CHECK_INTERVAL_SECS", &mut cfg.check_interval_secs);
        override_from_env("MODELWATCH_CHECK_TIMEOUT_SECS", &mut cfg.check_timeout_secs);
        override_from_env("MODELWATCH_MAX_PARALLEL_CHECKS", &mut cfg.max_parallel_checks);
        override_from_env("MODELWATCH_RETENTION_DAYS", &mut cfg.retention_days);
        override_from_env("MODELWATCH_CLEANUP_INTERVAL_SECS", &mut cfg.cleanup_interval_secs);
        override_from_env("MODELWATCH_REGISTRY_REFRESH_SECS", &mut cfg.registry_refresh_secs);
        override_from_env("MODELWATCH_STARTUP_JITTER_MS", &mut cfg.startup_jitter_ms);

        cfg
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_checks == 0 {
            return Err(ConfigError::NoConcurrency);
        }
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Zero("check interval"));
        }
        if self.check_timeout_secs == 0 {
            return Err(ConfigError::Zero("check timeout"));
        }
        if self.registry_refresh_secs == 0 {
            return Err(ConfigError::Zero("registry refresh"));
        }
        Ok(())
    }

    /// Global fallbacks applied to targets without provider overrides.
    pub fn target_defaults(&self) -> TargetDefaults {
        TargetDefaults {
            interval: Duration::from_secs(self.check_interval_secs),
            timeout: Duration::from_secs(self.check_timeout_secs),
        }
    }
}

/// Interval and timeout used when a provider does not set its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDefaults {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for TargetDefaults {
    fn default() -> Self {
        ServerConfig::default().target_defaults()
    }
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparsable {}={:?}", key, raw),
        }
    }
}
