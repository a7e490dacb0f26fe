//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::TransferError;

/// Retry policy for a labeled transfer operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Label used in log lines (`retry:<label>`).
    pub label: &'static str,
    /// Total attempt bound, including the first try.
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Ceiling for the exponential delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to add uniform jitter on top of the exponential delay.
    pub use_jitter: bool,
}

impl RetryPolicy {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            max_attempts: 10,
            initial_delay_ms: 30_000,
            max_delay_ms: 300_000,
            use_jitter: true,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `min(max, initial * 2^attempt)` plus up to 20% uniform jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay_ms as f64 * 2f64.powi(attempt.min(31) as i32);
        let capped = exp.min(self.max_delay_ms as f64);

        let delay_ms = if self.use_jitter {
            capped + capped * 0.2 * rand::random::<f64>()
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Drive `op` under `policy` until it succeeds, exhausts its attempts, or
/// hits a non-retryable error.
///
/// The closure receives the 0-indexed attempt number and MUST construct any
/// stream or reader it consumes inside its own body; a reader captured from
/// the surrounding scope is already drained on the second attempt.
///
/// `Auth` errors are granted exactly one immediate retry (the operation is
/// expected to force-refresh its token before returning the error); a second
/// `Auth` failure is final.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt: u32 = 0;
    let mut auth_retried = false;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err @ TransferError::Auth { .. }) => {
                if auth_retried {
                    return Err(err);
                }
                auth_retried = true;
                attempt += 1;
                warn!("retry:{} auth rejected, retrying once with refreshed token", policy.label);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                let failures = attempt + 1;
                if !policy.should_retry(failures) {
                    return Err(TransferError::Exhausted {
                        attempts: failures,
                        source: Box::new(err),
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "retry:{} attempt {}/{} failed: {}; backing off {:?}",
                    policy.label, failures, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
