//! Exponential backoff for transient source and store failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds (caps exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is exhausted. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.next_delay(attempt) else {
                        tracing::error!(what, attempts = attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    };
                    tracing::warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
