//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{Backoff, RetryPolicy};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of every stack name the engine manages.
    pub stack_prefix: String,

    /// First delay between status polls (milliseconds).
    pub poll_initial_interval_ms: u64,

    /// Growth factor applied to the poll interval.
    pub poll_multiplier: f64,

    /// Upper bound for the poll interval (milliseconds).
    pub poll_max_interval_ms: u64,

    /// Attempts for API calls failing with transient errors (0 = no retry).
    pub retry_max_attempts: u32,

    /// First delay between transient retries (milliseconds).
    pub retry_initial_delay_ms: u64,

    /// Upper bound for the transient retry delay (milliseconds).
    pub retry_max_delay_ms: u64,

    /// Deadline for a stack creation to reach a terminal status (seconds).
    pub create_timeout_secs: u64,

    /// Deadline for a stack update to reach a terminal status (seconds).
    pub update_timeout_secs: u64,

    /// Deadline for a stack deletion to reach a terminal status (seconds).
    pub delete_timeout_secs: u64,

    /// Deadline for a dependency gate during teardown (seconds).
    pub dependency_wait_timeout_secs: u64,

    /// Maximum number of concurrently running children of a parallel node.
    pub max_parallel: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stack_prefix: "stackrun".to_string(),
            poll_initial_interval_ms: 5_000,
            poll_multiplier: 1.5,
            poll_max_interval_ms: 30_000,
            retry_max_attempts: 5,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 20_000,
            create_timeout_secs: 35 * 60,
            update_timeout_secs: 35 * 60,
            delete_timeout_secs: 25 * 60,
            dependency_wait_timeout_secs: 20 * 60,
            max_parallel: None,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make polling spin or never progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("stack_prefix must not be empty".into()));
        }
        if self.poll_initial_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_initial_interval_ms must be positive".into(),
            ));
        }
        if self.poll_multiplier < 1.0 {
            return Err(ConfigError::Invalid("poll_multiplier must be >= 1.0".into()));
        }
        if self.poll_max_interval_ms < self.poll_initial_interval_ms {
            return Err(ConfigError::Invalid(
                "poll_max_interval_ms must be >= poll_initial_interval_ms".into(),
            ));
        }
        if self.max_parallel == Some(0) {
            return Err(ConfigError::Invalid("max_parallel must be positive".into()));
        }
        Ok(())
    }

    /// Backoff used while polling stack status.
    pub fn poll_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.poll_initial_interval_ms),
            self.poll_multiplier,
            Duration::from_millis(self.poll_max_interval_ms),
        )
    }

    /// Retry policy for transient API errors.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            backoff: Backoff::new(
                Duration::from_millis(self.retry_initial_delay_ms),
                2.0,
                Duration::from_millis(self.retry_max_delay_ms),
            ),
        }
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    pub fn dependency_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_wait_timeout_secs)
    }
}
