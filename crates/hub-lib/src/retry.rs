//! Retry with exponential backoff
//!
//! The delay before retry `n` is `base_delay * 2^n`. A classifier decides per
//! error whether to back off, retry at once without advancing the backoff
//! exponent (name conflicts), or give up immediately (validation failures).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the current backoff delay, then retry
    Backoff,
    /// Retry right away; the backoff exponent is not advanced
    Immediate,
    /// Stop and return the error
    Abort,
}

/// Attempt budget and base delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff delay after the `step`-th backed-off failure (0-based)
    pub fn delay_for(&self, step: u32) -> Duration {
        let factor = 1u32.checked_shl(step).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, the classifier aborts, or attempts run out.
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, operation: &str, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff_step = 0u32;
        let mut attempt = 0u32;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let decision = classify(&err);
            if decision == RetryDecision::Abort {
                return Err(err);
            }

            attempt += 1;
            if attempt >= max_attempts {
                warn!(
                    operation = %operation,
                    attempts = attempt,
                    error = %err,
                    "Max retries reached"
                );
                return Err(err);
            }

            match decision {
                RetryDecision::Immediate => {
                    warn!(operation = %operation, attempt, error = %err, "Retrying immediately");
                }
                _ => {
                    let delay = self.delay_for(backoff_step);
                    backoff_step += 1;
                    info!(
                        operation = %operation,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
