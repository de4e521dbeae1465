//! Engine configuration.

use std::time::Duration;

/// Default bounded wait for the per-product advisory lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Tunables for the stock engine.
///
/// The advisory layer itself is chosen by injecting a
/// [`LockCoordinator`](stockhold_core::LockCoordinator) implementation
/// (keyed semaphore, Postgres advisory locks, or no-op); this config only
/// bounds how long an operation waits for it.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// How long an operation waits for the advisory lock before failing fast
    /// with a lock timeout.
    pub lock_timeout: Duration,
}

impl EngineConfig {
    /// Creates a config with the given lock timeout
    #[must_use]
    pub const fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}
