//! Retry policy for transient node failures.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Fixed delay between retries
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay
    #[default]
    Exponential,
}

impl std::str::FromStr for BackoffType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffType::Fixed),
            "linear" => Ok(BackoffType::Linear),
            "exponential" => Ok(BackoffType::Exponential),
            _ => Err(format!("Unknown backoff type: {}", s)),
        }
    }
}

/// How long a run waits before retrying a failed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry (seconds)
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: u64,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: BackoffType,

    /// Ceiling on any single delay (seconds)
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,
}

fn default_base_delay_seconds() -> u64 {
    60
}

fn default_max_delay_seconds() -> u64 {
    3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_seconds: default_base_delay_seconds(),
            backoff: BackoffType::default(),
            max_delay_seconds: default_max_delay_seconds(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay_seconds;
        let secs = match self.backoff {
            BackoffType::Fixed => base,
            BackoffType::Linear => base.saturating_mul(u64::from(attempt.max(1))),
            BackoffType::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
            }
        };
        Duration::seconds(secs.min(self.max_delay_seconds).min(i64::MAX as u64 / 1000) as i64)
    }
}
