//! Per-call deadlines and bounded exponential backoff for durable calls

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::DurableConfig;
use crate::error::{Result, StrataError};

/// Deadline and retry budget for durable tier calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts for idempotent calls (1 = no retry)
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after every retry
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay
    pub max_delay: Duration,
    /// Deadline for each individual attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DurableConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DurableConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_secs(2),
            attempt_timeout: config.operation_timeout(),
        }
    }

    /// Run a single attempt under the per-call deadline
    pub async fn once<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StrataError::timeout(
                operation,
                self.attempt_timeout.as_millis() as u64,
            )),
        }
    }

    /// Run an idempotent call, retrying transient failures with backoff.
    ///
    /// Only use this for calls that are safe to repeat (upserts, reads).
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;

        loop {
            match self.once(operation, call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "{} failed on attempt {}/{}, retrying in {:?}: {}",
                        operation, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
