//! # Stockhold Postgres
//!
//! `PostgreSQL` implementation of the Stockhold storage and locking traits.
//!
//! This crate provides the production backend for the stock reservation
//! engine. It uses sqlx with runtime-bound queries and supports:
//!
//! - Transactional counter mutations with `SELECT ... FOR UPDATE` row locks
//! - Savepoint-isolated movement ledger appends (a failed audit write never
//!   poisons the enclosing transaction)
//! - Session-scoped advisory locks for the engine's per-product advisory
//!   layer, spanning every process that shares the database
//! - Connection pooling and embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use stockhold_postgres::{PostgresConfig, PostgresStockStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PostgresConfig::from_env();
//!     let store = PostgresStockStore::connect(&config).await?;
//!     store.run_migrations().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod lock;
pub mod store;

pub use config::PostgresConfig;
pub use lock::PgAdvisoryLockCoordinator;
pub use store::PostgresStockStore;
