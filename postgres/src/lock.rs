//! Session-scoped `PostgreSQL` advisory locks.
//!
//! Multi-process deployments share one database, so the in-process keyed
//! semaphore cannot see a competing process. This coordinator maps each
//! product to a `pg_advisory_lock` key and polls `pg_try_advisory_lock` on a
//! dedicated pooled connection until the bounded wait expires.
//!
//! Session advisory locks live on the connection that took them. The token
//! therefore owns its connection for the lifetime of the lock: release runs
//! `pg_advisory_unlock` and returns the connection to the pool, and if the
//! unlock cannot be issued the connection is detached and closed so the
//! server frees the lock with the session. Either way a crashed or dropped
//! holder can only ever delay other callers, never wedge them permanently.

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use stockhold_core::lock::{LockCoordinator, LockError, LockToken};
use stockhold_core::types::ProductId;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maps a product to the 64-bit advisory lock keyspace.
///
/// Truncating the UUID keeps the full low half; collisions are theoretically
/// possible and merely over-serialize two unrelated products, which is safe.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn advisory_key(product_id: ProductId) -> i64 {
    u128::from_le_bytes(*product_id.as_uuid().as_bytes()) as i64
}

/// Advisory lock coordinator backed by `PostgreSQL` session locks.
#[derive(Clone)]
pub struct PgAdvisoryLockCoordinator {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgAdvisoryLockCoordinator {
    /// Creates a coordinator over the given pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the polling interval used while waiting for a contended lock
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

struct PgAdvisoryLockToken {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl LockToken for PgAdvisoryLockToken {}

impl Drop for PgAdvisoryLockToken {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let key = self.key;

        // Best-effort release; never surfaces to the caller. Outside a
        // runtime the connection is closed instead, and the server frees the
        // lock with the session.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(&mut *conn)
                    .await
                {
                    tracing::warn!(
                        error = %err,
                        key,
                        "failed to release advisory lock; closing its connection"
                    );
                    drop(conn.detach());
                }
            });
        } else {
            drop(conn.detach());
        }
    }
}

impl LockCoordinator for PgAdvisoryLockCoordinator {
    fn acquire(
        &self,
        product_id: ProductId,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn LockToken>, LockError>> + Send + '_>> {
        let pool = self.pool.clone();
        let poll_interval = self.poll_interval;
        Box::pin(async move {
            let key = advisory_key(product_id);
            let deadline = tokio::time::Instant::now() + timeout;
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| LockError::Backend(format!("Failed to acquire connection: {e}")))?;

            loop {
                let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| LockError::Backend(format!("Failed to try advisory lock: {e}")))?;

                if locked {
                    return Ok(Box::new(PgAdvisoryLockToken {
                        conn: Some(conn),
                        key,
                    }) as Box<dyn LockToken>);
                }
                if tokio::time::Instant::now() + poll_interval >= deadline {
                    return Err(LockError::Timeout { product_id });
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_stable_per_product() {
        let product = ProductId::new();
        assert_eq!(advisory_key(product), advisory_key(product));
    }

    #[test]
    fn distinct_products_map_to_distinct_keys() {
        // Not guaranteed in general (the keyspace is half the UUID), but two
        // fresh v4 UUIDs colliding would indicate a broken mapping.
        let first = advisory_key(ProductId::new());
        let second = advisory_key(ProductId::new());
        assert_ne!(first, second);
    }
}
