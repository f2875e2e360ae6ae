//! Exponential-backoff retry over a classifiable set of transient errors.

use crate::error::{Result, TuyaError};
use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retrying a fallible operation.
///
/// `retry_on` decides whether an error class is transient; everything else
/// is rethrown immediately. The default classifier accepts I/O errors,
/// connect failures, and timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub retry_on: fn(&TuyaError) -> bool,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        factor: 1.0,
        retry_on: TuyaError::is_retryable,
    };

    /// 3 attempts, 500 ms growing to 2 s, factor 1.5.
    pub const QUICK: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(2),
        factor: 1.5,
        retry_on: TuyaError::is_retryable,
    };

    /// 3 attempts, 1 s growing to 10 s, factor 2.
    pub const STANDARD: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        factor: 2.0,
        retry_on: TuyaError::is_retryable,
    };

    /// 5 attempts, 1 s growing to 30 s, factor 2.
    pub const AGGRESSIVE: RetryPolicy = RetryPolicy {
        max_attempts: 5,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        factor: 2.0,
        retry_on: TuyaError::is_retryable,
    };

    /// Backoff before the attempt following `failed_attempts` failures:
    /// `min(initial * factor^(failed_attempts - 1), max)`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exp = self.factor.powi(failed_attempts.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(exp).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Invokes `op` until it succeeds, the error is non-retryable, or the
/// attempt budget is exhausted. Retried errors are invisible to the caller.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !(policy.retry_on)(&e) || attempts >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.backoff(attempts);
                debug!(
                    "attempt {}/{} failed ({}), retrying in {:?}",
                    attempts, policy.max_attempts, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
