//! Advisory per-product locking.
//!
//! The engine serializes lifecycle operations per product behind a named,
//! timeout-bound advisory lock before opening its transaction. The lock is an
//! optimization, not the correctness boundary: it keeps concurrent callers on
//! a hot product (a flash sale on one SKU) from piling wasted transactions on
//! the same row lock. The transactional row-level lock inside the data store
//! remains the real safety net, so a crashed lock holder can never corrupt
//! state; at worst it delays other callers until the timeout.
//!
//! # Implementations
//!
//! - [`KeyedMutexCoordinator`]: in-process keyed semaphore, for single-node
//!   deployments and tests.
//! - [`NoopLockCoordinator`]: disables the advisory layer entirely, leaving
//!   only the row lock.
//! - `PgAdvisoryLockCoordinator` (in `stockhold-postgres`): session-scoped
//!   `PostgreSQL` advisory locks spanning processes that share one database.
//!
//! # Release semantics
//!
//! Release is RAII: dropping a [`LockToken`] releases the lock. Release is
//! best-effort and never surfaces an error to the caller.

use crate::error::StockError;
use crate::types::ProductId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors from the advisory lock layer.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was not released by its current holder within the wait bound.
    #[error("timed out waiting for the lock on product {product_id}")]
    Timeout {
        /// The contended product
        product_id: ProductId,
    },

    /// The lock backend itself failed (e.g. a lost database connection).
    #[error("lock backend failure: {0}")]
    Backend(String),
}

impl From<LockError> for StockError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { product_id } => Self::LockTimeout { product_id },
            LockError::Backend(detail) => Self::Storage(detail),
        }
    }
}

/// A held advisory lock.
///
/// Dropping the token releases the lock. Release is best-effort by design;
/// implementations log failures instead of raising them.
pub trait LockToken: Send {}

/// Acquires named, timeout-bound, per-product advisory locks.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` to enable trait object usage (`Arc<dyn LockCoordinator>`), so
/// the engine can swap the in-process coordinator for a distributed one
/// without changing its own code.
pub trait LockCoordinator: Send + Sync {
    /// Acquire the lock for `product_id`, waiting up to `timeout`.
    ///
    /// On success returns a token whose drop releases the lock.
    ///
    /// # Errors
    ///
    /// - [`LockError::Timeout`]: the current holder did not release in time
    /// - [`LockError::Backend`]: the lock backend failed
    fn acquire(
        &self,
        product_id: ProductId,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn LockToken>, LockError>> + Send + '_>>;
}

// ============================================================================
// In-process keyed semaphore
// ============================================================================

/// In-process advisory lock coordinator backed by one semaphore per product.
///
/// Suitable for single-node deployments where every caller shares the
/// process, and for concurrency tests. Slots are created on first use and
/// retained for the lifetime of the coordinator; the map is bounded by the
/// number of distinct products seen.
#[derive(Debug, Default)]
pub struct KeyedMutexCoordinator {
    slots: Mutex<HashMap<ProductId, Arc<Semaphore>>>,
}

impl KeyedMutexCoordinator {
    /// Creates a coordinator with no slots yet
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, product_id: ProductId) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(product_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }
}

struct KeyedLockToken {
    // Dropping the permit frees the slot.
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl LockToken for KeyedLockToken {}

impl LockCoordinator for KeyedMutexCoordinator {
    fn acquire(
        &self,
        product_id: ProductId,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn LockToken>, LockError>> + Send + '_>> {
        let slot = self.slot(product_id);
        Box::pin(async move {
            match tokio::time::timeout(timeout, slot.acquire_owned()).await {
                Ok(Ok(permit)) => {
                    Ok(Box::new(KeyedLockToken { _permit: permit }) as Box<dyn LockToken>)
                }
                Ok(Err(closed)) => Err(LockError::Backend(format!("lock slot closed: {closed}"))),
                Err(_) => Err(LockError::Timeout { product_id }),
            }
        })
    }
}

// ============================================================================
// No-op coordinator
// ============================================================================

/// Disables the advisory layer.
///
/// Every acquisition succeeds immediately; only the transactional row lock
/// serializes callers. Used by tests that exercise the row-lock path directly
/// and by deployments that prefer raw row-lock contention over an advisory
/// layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLockCoordinator;

struct NoopLockToken;

impl LockToken for NoopLockToken {}

impl LockCoordinator for NoopLockCoordinator {
    fn acquire(
        &self,
        _product_id: ProductId,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn LockToken>, LockError>> + Send + '_>> {
        Box::pin(async { Ok(Box::new(NoopLockToken) as Box<dyn LockToken>) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(25);

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = KeyedMutexCoordinator::new();
        let product = ProductId::new();

        let _held = locks.acquire(product, SHORT).await.unwrap();
        let contended = locks.acquire(product, SHORT).await;
        assert!(matches!(contended, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn dropping_the_token_releases_the_lock() {
        let locks = KeyedMutexCoordinator::new();
        let product = ProductId::new();

        let held = locks.acquire(product, SHORT).await.unwrap();
        drop(held);
        assert!(locks.acquire(product, SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn distinct_products_do_not_contend() {
        let locks = KeyedMutexCoordinator::new();

        let _first = locks.acquire(ProductId::new(), SHORT).await.unwrap();
        assert!(locks.acquire(ProductId::new(), SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn noop_coordinator_never_blocks() {
        let locks = NoopLockCoordinator;
        let product = ProductId::new();

        let _first = locks.acquire(product, SHORT).await.unwrap();
        assert!(locks.acquire(product, SHORT).await.is_ok());
    }

    #[test]
    fn timeout_maps_to_the_public_lock_error() {
        let product = ProductId::new();
        let err: StockError = LockError::Timeout { product_id: product }.into();
        assert!(matches!(err, StockError::LockTimeout { product_id } if product_id == product));
    }
}
