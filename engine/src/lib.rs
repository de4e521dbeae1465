//! # Stockhold Engine
//!
//! The stock reservation orchestrator: the one component allowed to mutate
//! product counters and reservation rows.
//!
//! Every public operation follows the same template: acquire the per-product
//! advisory lock(s), open a transaction, re-read the authoritative counters
//! and rows under a blocking row-level lock, validate, mutate, append a
//! movement ledger entry, commit, release the lock(s). Any failure after the
//! transaction opens triggers a full rollback before the error is returned,
//! and lock release is RAII so it happens on every path.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use stockhold_core::{KeyedMutexCoordinator, OwnerId, ClientId, ProductId, SystemClock};
//! use stockhold_engine::StockEngine;
//! use stockhold_testing::mocks::InMemoryStockStore;
//!
//! # async fn example() -> stockhold_core::Result<()> {
//! let store = Arc::new(InMemoryStockStore::new());
//! let engine = StockEngine::new(
//!     store.clone(),
//!     Arc::new(KeyedMutexCoordinator::new()),
//!     Arc::new(SystemClock),
//! );
//!
//! let (owner, product, client) = (OwnerId::new(), ProductId::new(), ClientId::new());
//! store.seed_product(owner, product, 10, 0).await;
//!
//! let reservation = engine
//!     .reserve(product, client, owner, 2, "live-cart", "row-912")
//!     .await?;
//! engine.commit(reservation, owner).await?;
//!
//! let availability = engine.check_availability(product, owner).await?;
//! assert_eq!(availability.stock, 8);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod retry;

pub use config::EngineConfig;
pub use engine::StockEngine;
pub use retry::{retry_with_backoff, RetryPolicy};
