//! # Stockhold Core
//!
//! Core types and storage abstractions for the Stockhold stock reservation
//! engine.
//!
//! Stockhold guards the stock counters of a live-commerce platform: many
//! concurrent callers (live carts, checkout flows, admin corrections) claim
//! limited product stock through a three-phase reservation lifecycle
//! (reserve → commit → release) without ever overselling a product.
//!
//! ## Core Concepts
//!
//! - **Stock counters**: per-product `stock` / `reserved` pair owned by the
//!   catalog and mutated only through the engine. `available = stock − reserved`
//!   never goes negative.
//! - **Reservation**: a temporary hold of quantity against a product, with a
//!   strict one-way state machine (`reserved` → `committed` | `released`).
//! - **Movement ledger**: append-only audit trail of every stock-affecting
//!   event; diagnostic, never authoritative.
//! - **`StockStore` / `StockTx`**: the transactional storage boundary. Counters
//!   are always re-read under a row lock inside the same transaction that
//!   mutates them.
//! - **`LockCoordinator`**: advisory per-product locking that reduces wasted
//!   transaction retries on hot products; not trusted alone for correctness.
//!
//! ## Architecture Principles
//!
//! - No ambient state: every operation takes the tenant (`OwnerId`) and product
//!   explicitly; the engine is a plain service object over injected traits.
//! - Two lock layers, one correctness boundary: the advisory lock is an
//!   optimization, the transactional row lock is the guarantee.
//! - Typed failures everywhere; the movement ledger is the only best-effort
//!   write in the system.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod availability;
pub mod environment;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod store;
pub mod types;

pub use availability::{Availability, AvailabilityCalculator};
pub use environment::{Clock, SystemClock};
pub use error::{Result, StockError};
pub use ledger::{AdjustmentKind, MovementEntry, MovementKind, NewMovement};
pub use lock::{KeyedMutexCoordinator, LockCoordinator, LockError, LockToken, NoopLockCoordinator};
pub use store::{StockStore, StockTx};
pub use types::{
    ClientId, NewReservation, OwnerId, ProductId, Reservation, ReservationId, ReservationStatus,
    StockCounters,
};
