//! Retry strategies and utilities for activity and backend calls
//!
//! Every activity invocation and every store, queue and history call is
//! bounded by a [`RetryPolicy`]: exponential backoff with an attempt cap and
//! optional jitter. Only errors that classify as transient are retried.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::future::Future;
use std::time::Duration;

use ordercore_types::{HistoryError, QueueError, StoreError};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BackoffMultiplier, MaxRetryAttempts, RetryBaseDelayMs, RetryMaxDelayMs};
use crate::errors::ActivityError;

/// Classifies errors for the retry loop.
pub trait Transient {
    /// Whether another attempt may succeed.
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

impl Transient for HistoryError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

impl Transient for ActivityError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Retry strategy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: MaxRetryAttempts,
    base_delay: RetryBaseDelayMs,
    max_delay: RetryMaxDelayMs,
    multiplier: BackoffMultiplier,
    use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            MaxRetryAttempts::try_new(3).expect("3 is a valid attempt count"),
            RetryBaseDelayMs::try_new(100).expect("100ms is a valid base delay"),
            RetryMaxDelayMs::try_new(5_000).expect("5s is a valid max delay"),
            BackoffMultiplier::try_new(2.0).expect("2.0 is a valid multiplier"),
        )
    }
}

impl RetryPolicy {
    /// Create a jittered policy from validated parts.
    pub const fn new(
        max_attempts: MaxRetryAttempts,
        base_delay: RetryBaseDelayMs,
        max_delay: RetryMaxDelayMs,
        multiplier: BackoffMultiplier,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier,
            use_jitter: true,
        }
    }

    /// Policy with the shortest allowed delays, for tests and tools.
    pub fn fast(max_attempts: MaxRetryAttempts) -> Self {
        Self {
            base_delay: RetryBaseDelayMs::try_new(10).expect("10ms is a valid base delay"),
            max_delay: RetryMaxDelayMs::try_new(100).expect("100ms is a valid max delay"),
            use_jitter: false,
            max_attempts,
            ..Self::default()
        }
    }

    /// Disable jitter, making delays exact.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Attempts including the first.
    pub const fn max_attempts(&self) -> MaxRetryAttempts {
        self.max_attempts
    }

    /// Delay after the first failed attempt.
    pub const fn base_delay(&self) -> RetryBaseDelayMs {
        self.base_delay
    }

    /// Cap on any single delay.
    pub const fn max_delay(&self) -> RetryMaxDelayMs {
        self.max_delay
    }

    /// Growth factor between consecutive delays.
    pub const fn multiplier(&self) -> BackoffMultiplier {
        self.multiplier
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// `base * multiplier^(attempt - 1)`, capped at the max delay, then
    /// scaled by a factor in `[0.8, 1.2)` when jitter is on.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };

        let growth = f64::from(self.multiplier).powi(exponent.min(64) as i32);
        let uncapped_ms = u64::from(self.base_delay) as f64 * growth;
        let cap_ms = u64::from(self.max_delay) as f64;
        let mut delay_ms = uncapped_ms.min(cap_ms);

        if self.use_jitter {
            delay_ms *= rand::rng().random_range(0.8..1.2);
        }

        Duration::from_millis(delay_ms as u64)
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// The error is not worth retrying.
    #[error("permanent failure: {0}")]
    NonRetryable(E),
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::NonRetryable(_) => 1,
        }
    }

    /// The last underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable(error) => error,
        }
    }
}

/// Execute an operation with retry logic
///
/// Non-transient errors stop immediately. Transient errors are retried with
/// backoff until the policy's attempt count is used up.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let max_attempts = u32::from(policy.max_attempts);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt, "[retry.recovered] operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(error) if !error.is_transient() => {
                warn!(
                    operation = operation_name,
                    %error,
                    "[retry.non_retryable] operation failed with non-retryable error"
                );
                return Err(RetryError::NonRetryable(error));
            }
            Err(error) if attempt >= max_attempts => {
                warn!(
                    operation = operation_name,
                    attempts = attempt,
                    %error,
                    "[retry.exhausted] giving up"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }
            Err(error) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    ?delay,
                    %error,
                    "[retry.backoff] operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
