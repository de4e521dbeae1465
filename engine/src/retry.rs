//! Retry with exponential backoff for lock-contention failures.
//!
//! Lock timeouts are contention facts, not business facts: the recommended
//! caller behavior is to retry with backoff (or surface a generic "please
//! retry" message). This module provides that loop, retrying **only** errors
//! where [`StockError::is_retryable`] holds; a sold-out product must never
//! be hammered by automatic retries.
//!
//! # Example
//!
//! ```no_run
//! use stockhold_engine::retry::{retry_with_backoff, RetryPolicy};
//! use stockhold_engine::StockEngine;
//! use stockhold_core::{ClientId, OwnerId, ProductId};
//!
//! # async fn example(engine: &StockEngine) -> stockhold_core::Result<()> {
//! # let (product, client, owner) = (ProductId::new(), ClientId::new(), OwnerId::new());
//! let policy = RetryPolicy::default();
//! let reservation = retry_with_backoff(policy, || {
//!     engine.reserve(product, client, owner, 1, "live-cart", "row-912")
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use stockhold_core::error::{Result, StockError};
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 5 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt number.
    ///
    /// Uses exponential backoff: `delay = initial_delay * multiplier^attempt`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let delay = Duration::from_millis(
            (self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32)) as u64,
        );

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Retry a stock operation with exponential backoff.
///
/// Retries only failures where [`StockError::is_retryable`] holds (lock
/// timeouts); every other error returns immediately.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last retryable error once
/// `max_retries` attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "stock operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "stock operation hit lock contention, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(
                        attempt,
                        error = %err,
                        "stock operation failed after max retries"
                    );
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stockhold_core::ProductId;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = quick_policy();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn lock_timeouts_are_retried_until_success() {
        let attempts = AtomicUsize::new(0);
        let product_id = ProductId::new();

        let result = retry_with_backoff(quick_policy(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(StockError::LockTimeout { product_id })
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_errors_are_never_retried() {
        let attempts = AtomicUsize::new(0);
        let product_id = ProductId::new();

        let result: Result<()> = retry_with_backoff(quick_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(StockError::InsufficientStock {
                    product_id,
                    requested: 2,
                    available: 0,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(StockError::InsufficientStock { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_after_the_configured_budget() {
        let attempts = AtomicUsize::new(0);
        let product_id = ProductId::new();

        let result: Result<()> = retry_with_backoff(quick_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(StockError::LockTimeout { product_id }) }
        })
        .await;

        assert!(matches!(result, Err(StockError::LockTimeout { .. })));
        // Initial attempt plus max_retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
