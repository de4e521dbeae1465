//! # Stockhold Testing
//!
//! Testing utilities for the Stockhold reservation engine.
//!
//! This crate provides:
//! - [`mocks::InMemoryStockStore`]: a deterministic, fully in-memory
//!   implementation of the `StockStore` / `StockTx` traits with
//!   fault-injection knobs
//! - [`mocks::FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use stockhold_core::{OwnerId, ProductId, StockStore};
//! use stockhold_testing::mocks::InMemoryStockStore;
//!
//! # async fn example() -> stockhold_core::Result<()> {
//! let store = InMemoryStockStore::new();
//! let owner = OwnerId::new();
//! let product = ProductId::new();
//! store.seed_product(owner, product, 10, 0).await;
//!
//! let counters = store.stock_levels(owner, product).await?;
//! assert_eq!(counters.map(|c| c.available()), Some(10));
//! # Ok(())
//! # }
//! ```

pub mod mocks;

pub use mocks::{FixedClock, InMemoryStockStore};
