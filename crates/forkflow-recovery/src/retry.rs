//! Retry with backoff and cancellable timeouts.

use forkflow_core::ErrorHandlingConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often and how fast to retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Growth factor between retries when backing off exponentially
    pub multiplier: f64,
    /// Upper bound of any delay, in milliseconds
    pub max_delay_ms: u64,
    /// Whether delays grow between retries
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30000,
            exponential: true,
        }
    }
}

impl From<&ErrorHandlingConfig> for RetryPolicy {
    fn from(config: &ErrorHandlingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_delay_ms,
            multiplier: 2.0,
            max_delay_ms: config.max_retry_delay_ms,
            exponential: config.exponential_backoff,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay_ms = if self.exponential {
            let exponent = retry.saturating_sub(1) as i32;
            (self.base_delay_ms as f64 * self.multiplier.powi(exponent)).min(self.max_delay_ms as f64)
        } else {
            (self.base_delay_ms as f64).min(self.max_delay_ms as f64)
        };
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Whether another retry is allowed after `failed_attempts` failures
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts <= self.max_retries
    }
}

/// Why [`retry_with_backoff`] gave up
#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// Every allowed attempt failed
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the last attempt
        last_error: E,
    },

    /// The token was cancelled between attempts
    #[error("Retry cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made
        attempts: u32,
    },

    /// The operation failed with an error that must not be retried
    #[error("Permanent failure: {0}")]
    Permanent(E),
}

/// Run `operation` until it succeeds, retrying errors accepted by
/// `is_transient` with the delays of `policy`.
///
/// The operation receives the 1-based attempt number. Cancellation is checked
/// before every attempt and interrupts a pending delay.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    is_transient: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_transient(&error) {
            debug!(attempt, error = %error, "Permanent failure, not retrying");
            return Err(RetryError::Permanent(error));
        }
        if !policy.allows_retry(attempt) {
            warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.delay_for(attempt);
        debug!(attempt, ?delay, error = %error, "Attempt failed, retrying");
        tokio::select! {
            _ = token.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Why [`with_timeout`] did not produce a value
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// The timeout fired first
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// The caller cancelled first
    #[error("Cancelled")]
    Cancelled,
}

/// Race `future` against a timeout and the caller's cancellation
pub async fn with_timeout<T, Fut>(
    duration: Duration,
    token: &CancellationToken,
    future: Fut,
) -> Result<T, TimeoutError>
where
    Fut: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TimeoutError::Cancelled),
        value = future => Ok(value),
        _ = tokio::time::sleep(duration) => Err(TimeoutError::TimedOut(duration)),
    }
}
