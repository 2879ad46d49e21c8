//! Retry backoff policies for the transaction executor

use std::time::Duration;

use pc_config::BackoffConfig;

pub trait Backoff: Send + Sync {
    /// Delay before retry number `attempt` (zero-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Capped exponential backoff: `initial * multiplier^attempt`, at most `max`.
#[derive(Debug, Clone)]
pub struct ExpBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for ExpBackoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }
}

impl Backoff for ExpBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstBackoff(pub Duration);

impl Backoff for ConstBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Retry bound and backoff injected into each repository.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: ExpBackoff,
}

impl From<&pc_config::RepositoryConfig> for RetryPolicy {
    fn from(config: &pc_config::RepositoryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: ExpBackoff::from(&config.backoff),
        }
    }
}
