//! Engine-wide settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Engine settings section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of phase dispatches in flight at once.
    #[serde(rename = "max-parallel")]
    pub max_parallel: usize,

    /// Per-call strategy timeout in milliseconds (None = no limit).
    #[serde(rename = "strategy-timeout-ms", skip_serializing_if = "Option::is_none")]
    pub strategy_timeout_ms: Option<u64>,

    /// Adapter retry behaviour.
    pub retry: RetryConfig,

    /// Default log level for the binary.
    #[serde(rename = "log-level")]
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            strategy_timeout_ms: None,
            retry: RetryConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn strategy_timeout(&self) -> Option<Duration> {
        self.strategy_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(EngineError::config("settings.max-parallel must be > 0"));
        }
        if self.strategy_timeout_ms == Some(0) {
            return Err(EngineError::config("settings.strategy-timeout-ms must be > 0"));
        }
        self.retry.validate()
    }
}

/// Exponential backoff for transient adapter errors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initial-backoff-ms")]
    pub initial_backoff_ms: u64,

    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.initial_backoff_ms.saturating_mul(2u64.pow(exp));
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::config("settings.retry.max-attempts must be > 0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(EngineError::config(
                "settings.retry.initial-backoff-ms must not exceed max-backoff-ms",
            ));
        }
        Ok(())
    }
}
