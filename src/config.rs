//! Orchestrator configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config. Values
//! are range-checked by [`OrchestratorConfig::validate`] before an orchestrator
//! is built from them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::RetryPolicy;
use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, MAX_PARALLELISM, POOL_IDLE_TIMEOUT_SECS, POOL_MAX_IDLE_PER_HOST,
    PROGRESS_INTERVAL, REQUEST_TIMEOUT_SECS, SPEED_HISTORY_SIZE, TEMP_DIR_NAME,
};
use crate::download::retry::DEFAULT_MAX_RETRIES;

/// Default retry base delay in milliseconds.
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value, rendered.
        value: String,
        /// Human-readable accepted range.
        expected: &'static str,
    },

    /// The config document could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Settings for a [`DownloadOrchestrator`](crate::DownloadOrchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Base directory under which each task gets its own chunk directory.
    pub temp_root: PathBuf,
    /// Largest parallelism `start` accepts.
    pub max_parallelism: usize,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Overall per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Idle pooled connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// Idle lifetime of a pooled connection in seconds.
    pub pool_idle_timeout_secs: u64,
    /// Minimum delay between progress events, in milliseconds.
    pub progress_interval_ms: u64,
    /// Number of speed samples in the moving average.
    pub speed_window: usize,
    /// Attempts per chunk before the run fails (first attempt included).
    pub max_chunk_attempts: u32,
    /// Base delay of the chunk retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// User-Agent override; the crate identity is used when unset.
    pub user_agent: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join(TEMP_DIR_NAME),
            max_parallelism: MAX_PARALLELISM,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            pool_max_idle_per_host: POOL_MAX_IDLE_PER_HOST,
            pool_idle_timeout_secs: POOL_IDLE_TIMEOUT_SECS,
            progress_interval_ms: u64::try_from(PROGRESS_INTERVAL.as_millis()).unwrap_or(500),
            speed_window: SPEED_HISTORY_SIZE,
            max_chunk_attempts: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            user_agent: None,
        }
    }
}

impl OrchestratorConfig {
    /// Parses and validates a JSON config document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown fields, and
    /// [`ConfigError::OutOfRange`] when a value fails validation.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise the
    /// same errors as [`from_json`](Self::from_json).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Validates every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::OutOfRange`] encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "max_parallelism",
            self.max_parallelism,
            1..=1024,
            "1..=1024",
        )?;
        check_range(
            "connect_timeout_secs",
            self.connect_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        check_range(
            "request_timeout_secs",
            self.request_timeout_secs,
            1..=86_400,
            "1..=86400",
        )?;
        check_range(
            "pool_max_idle_per_host",
            self.pool_max_idle_per_host,
            1..=1024,
            "1..=1024",
        )?;
        check_range(
            "progress_interval_ms",
            self.progress_interval_ms,
            0..=60_000,
            "0..=60000",
        )?;
        check_range("speed_window", self.speed_window, 1..=1000, "1..=1000")?;
        check_range(
            "max_chunk_attempts",
            self.max_chunk_attempts,
            1..=100,
            "1..=100",
        )?;
        check_range(
            "retry_base_delay_ms",
            self.retry_base_delay_ms,
            0..=60_000,
            "0..=60000",
        )?;
        if let Some(user_agent) = &self.user_agent
            && user_agent.trim().is_empty()
        {
            return Err(ConfigError::OutOfRange {
                field: "user_agent",
                value: format!("{user_agent:?}"),
                expected: "non-empty string",
            });
        }
        Ok(())
    }

    /// Minimum delay between progress events.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Retry policy applied to every chunk.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_chunk_attempts)
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms))
    }
}

fn check_range<T>(
    field: &'static str,
    value: T,
    range: std::ops::RangeInclusive<T>,
    expected: &'static str,
) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        })
    }
}
