//! Storage abstraction for counters, reservations, and the movement ledger.
//!
//! # Design
//!
//! The store is split in two:
//!
//! - [`StockStore`]: pure reads plus the entry point into a transaction.
//!   Reads never block on row locks and are safe for UIs ("X reserved for
//!   you") and reconciliation jobs.
//! - [`StockTx`]: an open transaction. Everything that mutates counters or
//!   reservation rows lives here and is only ever called from inside the
//!   engine's transactional envelope. The `*_for_update` reads take a blocking
//!   row-level lock, which is the correctness boundary of the whole system:
//!   two concurrent reservations of the same product cannot both observe the
//!   same stale `available` value.
//!
//! A transaction either commits or rolls back in full; implementations must
//! never persist partial state.
//!
//! # Implementations
//!
//! - `PostgresStockStore` (in `stockhold-postgres`): production implementation
//!   over sqlx with `SELECT ... FOR UPDATE` row locks.
//! - `InMemoryStockStore` (in `stockhold-testing`): deterministic testing
//!   implementation that serializes transactions behind a single async mutex.
//!
//! # Dyn Compatibility
//!
//! Both traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` to enable trait object usage (`Arc<dyn StockStore>`,
//! `Box<dyn StockTx>`).

use crate::error::Result;
use crate::ledger::{MovementEntry, NewMovement};
use crate::types::{
    NewReservation, OwnerId, ProductId, Reservation, ReservationId, StockCounters,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// An open transaction over the stock data.
///
/// Obtained from [`StockStore::begin`]; consumed by [`StockTx::commit`] or
/// [`StockTx::rollback`]. Dropping a transaction without committing must roll
/// it back (implementations inherit this from their backend).
pub trait StockTx: Send {
    /// Read the counters for a product, taking a blocking row-level lock that
    /// is held until the transaction ends.
    ///
    /// # Errors
    ///
    /// - [`StockError::ProductNotFound`](crate::StockError::ProductNotFound):
    ///   no counter row for this product and owner
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn stock_for_update(
        &mut self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<StockCounters>> + Send + '_>>;

    /// Overwrite the counters for a product.
    ///
    /// Only called after [`StockTx::stock_for_update`] in the same
    /// transaction, so the write is protected by the row lock.
    ///
    /// # Errors
    ///
    /// - [`StockError::ProductNotFound`](crate::StockError::ProductNotFound):
    ///   the counter row disappeared mid-transaction
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn write_stock(
        &mut self,
        owner_id: OwnerId,
        product_id: ProductId,
        counters: StockCounters,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Insert a reservation row with status `reserved`.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    ///   (including a duplicate pre-generated id)
    fn insert_reservation(
        &mut self,
        new: NewReservation,
        reserved_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Reservation>> + Send + '_>>;

    /// Read a reservation by id under a blocking row-level lock.
    ///
    /// Returns `None` when no row matches the id and owner.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn reservation_for_update(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Reservation>>> + Send + '_>>;

    /// Read all `reserved`-status rows for an originating action under
    /// blocking row-level locks.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn active_by_source_for_update<'a>(
        &'a mut self,
        source: &'a str,
        source_key: &'a str,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Reservation>>> + Send + 'a>>;

    /// Transition a reservation from `reserved` to `committed`.
    ///
    /// The precondition is enforced at the storage layer with a guarded
    /// update, backing the engine's own validation against the row it just
    /// read under lock.
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidReservationState`](crate::StockError::InvalidReservationState):
    ///   the reservation is already terminal
    /// - [`StockError::ReservationNotFound`](crate::StockError::ReservationNotFound):
    ///   no row matches the id and owner
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn mark_committed(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
        committed_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Transition a reservation from `reserved` to `released`.
    ///
    /// # Errors
    ///
    /// Same as [`StockTx::mark_committed`].
    fn mark_released(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
        released_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Append a movement ledger entry.
    ///
    /// Best-effort from the engine's perspective: the engine logs a failed
    /// append and continues, so implementations must guarantee that a failure
    /// here leaves the transaction usable (the Postgres store isolates the
    /// insert behind a savepoint).
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn append_movement(
        &mut self,
        movement: NewMovement,
        created_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Commit the transaction, making every staged mutation durable at once.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): the backend
    ///   failed to commit; no mutation from this transaction is persisted
    fn commit(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;

    /// Roll the transaction back, discarding every staged mutation.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    ///   while rolling back (the engine logs this; the transaction is dead
    ///   either way)
    fn rollback(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Storage for product counters, reservation rows, and the movement ledger.
pub trait StockStore: Send + Sync {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<Box<dyn StockTx>>> + Send + '_>>;

    /// Read the counters for a product without locking.
    ///
    /// Returns `None` when no counter row matches the product and owner.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn stock_levels(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StockCounters>>> + Send + '_>>;

    /// Read a reservation by id without locking.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn reservation(
        &self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Reservation>>> + Send + '_>>;

    /// Read all `reserved`-status rows for an originating action without
    /// locking.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn active_by_source<'a>(
        &'a self,
        source: &'a str,
        source_key: &'a str,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Reservation>>> + Send + 'a>>;

    /// Read the movement ledger for a product, oldest first.
    ///
    /// # Errors
    ///
    /// - [`StockError::Storage`](crate::StockError::Storage): backend failure
    fn movements_for_product(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MovementEntry>>> + Send + '_>>;
}
