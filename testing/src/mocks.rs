//! In-memory mock implementations for deterministic tests.
//!
//! [`InMemoryStockStore`] implements the storage traits over a single async
//! mutex: a transaction holds the mutex from `begin` until commit or
//! rollback, which serializes transactions strictly: a stronger guarantee
//! than per-product row locks, but observationally equivalent for the
//! per-product linearization the engine relies on. Rollback restores a
//! snapshot taken at `begin`, and an uncommitted transaction rolls back on
//! drop.
//!
//! Note that the non-transactional reads share the same mutex, so they block
//! while a transaction is open. Never issue a store-level read while holding
//! an open transaction on the same task.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stockhold_core::environment::Clock;
use stockhold_core::error::{Result, StockError};
use stockhold_core::ledger::{MovementEntry, NewMovement};
use stockhold_core::store::{StockStore, StockTx};
use stockhold_core::types::{
    NewReservation, OwnerId, ProductId, Reservation, ReservationId, ReservationStatus,
    StockCounters,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Fixed clock for deterministic tests
///
/// Always returns the same time, making timestamps reproducible.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use stockhold_core::environment::Clock;
/// use stockhold_testing::mocks::FixedClock;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

#[derive(Clone, Debug, Default)]
struct StoreState {
    products: Vec<((OwnerId, ProductId), StockCounters)>,
    reservations: Vec<Reservation>,
    movements: Vec<MovementEntry>,
}

impl StoreState {
    fn counters(&self, owner_id: OwnerId, product_id: ProductId) -> Option<StockCounters> {
        self.products
            .iter()
            .find(|(key, _)| *key == (owner_id, product_id))
            .map(|(_, counters)| *counters)
    }

    fn counters_mut(
        &mut self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Option<&mut StockCounters> {
        self.products
            .iter_mut()
            .find(|(key, _)| *key == (owner_id, product_id))
            .map(|(_, counters)| counters)
    }

    fn reservation(&self, id: ReservationId, owner_id: OwnerId) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.id == id && r.owner_id == owner_id)
    }

    fn reservation_mut(
        &mut self,
        id: ReservationId,
        owner_id: OwnerId,
    ) -> Option<&mut Reservation> {
        self.reservations
            .iter_mut()
            .find(|r| r.id == id && r.owner_id == owner_id)
    }

    fn active_by_source(
        &self,
        source: &str,
        source_key: &str,
        owner_id: OwnerId,
    ) -> Vec<Reservation> {
        self.reservations
            .iter()
            .filter(|r| {
                r.is_active()
                    && r.owner_id == owner_id
                    && r.source == source
                    && r.source_key == source_key
            })
            .cloned()
            .collect()
    }
}

/// Deterministic in-memory stock store.
///
/// Seed counters with [`InMemoryStockStore::seed_product`], then run the
/// engine against it exactly as against the Postgres store. Fault injection:
/// [`InMemoryStockStore::fail_next_movement`] makes the next ledger append
/// fail, for exercising the engine's best-effort ledger policy.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<StoreState>>,
    fail_next_movement: Arc<AtomicBool>,
}

impl InMemoryStockStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the counter row for a product.
    ///
    /// Counter rows belong to the catalog in production; tests seed them
    /// directly.
    pub async fn seed_product(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
        stock: u32,
        reserved: u32,
    ) {
        let mut state = self.state.lock().await;
        let counters = StockCounters::new(stock, reserved);
        if let Some(existing) = state.counters_mut(owner_id, product_id) {
            *existing = counters;
        } else {
            state.products.push(((owner_id, product_id), counters));
        }
    }

    /// Insert a reservation row verbatim, bypassing the engine.
    ///
    /// Used to set up drifted or historical states the engine itself would
    /// never produce.
    pub async fn seed_reservation(&self, reservation: Reservation) {
        self.state.lock().await.reservations.push(reservation);
    }

    /// Make the next [`StockTx::append_movement`] fail with a storage error.
    pub fn fail_next_movement(&self) {
        self.fail_next_movement.store(true, Ordering::SeqCst);
    }

    /// Snapshot of the recorded movement ledger, oldest first.
    pub async fn movements(&self) -> Vec<MovementEntry> {
        self.state.lock().await.movements.clone()
    }
}

struct InMemoryStockTx {
    guard: OwnedMutexGuard<StoreState>,
    snapshot: StoreState,
    committed: bool,
    fail_next_movement: Arc<AtomicBool>,
}

impl Drop for InMemoryStockTx {
    fn drop(&mut self) {
        // Uncommitted transactions roll back: restore the begin-time snapshot.
        if !self.committed {
            std::mem::swap(&mut *self.guard, &mut self.snapshot);
        }
    }
}

impl StockTx for InMemoryStockTx {
    fn stock_for_update(
        &mut self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<StockCounters>> + Send + '_>> {
        Box::pin(async move {
            self.guard
                .counters(owner_id, product_id)
                .ok_or(StockError::ProductNotFound {
                    product_id,
                    owner_id,
                })
        })
    }

    fn write_stock(
        &mut self,
        owner_id: OwnerId,
        product_id: ProductId,
        counters: StockCounters,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let existing = self.guard.counters_mut(owner_id, product_id).ok_or(
                StockError::ProductNotFound {
                    product_id,
                    owner_id,
                },
            )?;
            *existing = counters;
            Ok(())
        })
    }

    fn insert_reservation(
        &mut self,
        new: NewReservation,
        reserved_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Reservation>> + Send + '_>> {
        Box::pin(async move {
            if self.guard.reservations.iter().any(|r| r.id == new.id) {
                return Err(StockError::Storage(format!(
                    "duplicate reservation id {}",
                    new.id
                )));
            }
            let reservation = Reservation {
                id: new.id,
                product_id: new.product_id,
                client_id: new.client_id,
                owner_id: new.owner_id,
                qty: new.qty,
                status: ReservationStatus::Reserved,
                source: new.source,
                source_key: new.source_key,
                reserved_at,
                committed_at: None,
                released_at: None,
            };
            self.guard.reservations.push(reservation.clone());
            Ok(reservation)
        })
    }

    fn reservation_for_update(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Reservation>>> + Send + '_>> {
        Box::pin(async move { Ok(self.guard.reservation(reservation_id, owner_id).cloned()) })
    }

    fn active_by_source_for_update<'a>(
        &'a mut self,
        source: &'a str,
        source_key: &'a str,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Reservation>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.guard.active_by_source(source, source_key, owner_id)) })
    }

    fn mark_committed(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
        committed_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let reservation = self
                .guard
                .reservation_mut(reservation_id, owner_id)
                .ok_or(StockError::ReservationNotFound { reservation_id })?;
            if !reservation.is_active() {
                return Err(StockError::InvalidReservationState {
                    reservation_id,
                    status: reservation.status,
                });
            }
            reservation.status = ReservationStatus::Committed;
            reservation.committed_at = Some(committed_at);
            Ok(())
        })
    }

    fn mark_released(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
        released_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let reservation = self
                .guard
                .reservation_mut(reservation_id, owner_id)
                .ok_or(StockError::ReservationNotFound { reservation_id })?;
            if !reservation.is_active() {
                return Err(StockError::InvalidReservationState {
                    reservation_id,
                    status: reservation.status,
                });
            }
            reservation.status = ReservationStatus::Released;
            reservation.released_at = Some(released_at);
            Ok(())
        })
    }

    fn append_movement(
        &mut self,
        movement: NewMovement,
        created_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_next_movement.swap(false, Ordering::SeqCst) {
                return Err(StockError::Storage(
                    "injected movement ledger failure".to_string(),
                ));
            }
            self.guard.movements.push(MovementEntry {
                owner_id: movement.owner_id,
                product_id: movement.product_id,
                kind: movement.kind,
                qty: movement.qty,
                source: movement.source,
                source_key: movement.source_key,
                metadata: movement.metadata,
                created_at,
            });
            Ok(())
        })
    }

    fn commit(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        self.committed = true;
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        // Drop restores the snapshot.
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

impl StockStore for InMemoryStockStore {
    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<Box<dyn StockTx>>> + Send + '_>> {
        let state = Arc::clone(&self.state);
        let fail_next_movement = Arc::clone(&self.fail_next_movement);
        Box::pin(async move {
            let guard = state.lock_owned().await;
            let snapshot = guard.clone();
            Ok(Box::new(InMemoryStockTx {
                guard,
                snapshot,
                committed: false,
                fail_next_movement,
            }) as Box<dyn StockTx>)
        })
    }

    fn stock_levels(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StockCounters>>> + Send + '_>> {
        Box::pin(async move { Ok(self.state.lock().await.counters(owner_id, product_id)) })
    }

    fn reservation(
        &self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Reservation>>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .reservation(reservation_id, owner_id)
                .cloned())
        })
    }

    fn active_by_source<'a>(
        &'a self,
        source: &'a str,
        source_key: &'a str,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Reservation>>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .active_by_source(source, source_key, owner_id))
        })
    }

    fn movements_for_product(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MovementEntry>>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .movements
                .iter()
                .filter(|m| m.owner_id == owner_id && m.product_id == product_id)
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stockhold_core::ledger::MovementKind;

    fn new_reservation(owner_id: OwnerId, product_id: ProductId, qty: u32) -> NewReservation {
        NewReservation {
            id: ReservationId::new(),
            product_id,
            client_id: stockhold_core::ClientId::new(),
            owner_id,
            qty,
            source: "live-cart".to_string(),
            source_key: "row-1".to_string(),
        }
    }

    #[tokio::test]
    async fn committed_transactions_persist() {
        let store = InMemoryStockStore::new();
        let owner = OwnerId::new();
        let product = ProductId::new();
        store.seed_product(owner, product, 5, 0).await;

        let mut tx = store.begin().await.unwrap();
        tx.write_stock(owner, product, StockCounters::new(5, 2))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let counters = store.stock_levels(owner, product).await.unwrap().unwrap();
        assert_eq!(counters, StockCounters::new(5, 2));
    }

    #[tokio::test]
    async fn rolled_back_transactions_leave_no_trace() {
        let store = InMemoryStockStore::new();
        let owner = OwnerId::new();
        let product = ProductId::new();
        store.seed_product(owner, product, 5, 0).await;

        let mut tx = store.begin().await.unwrap();
        tx.write_stock(owner, product, StockCounters::new(0, 0))
            .await
            .unwrap();
        tx.insert_reservation(new_reservation(owner, product, 2), Utc::now())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let counters = store.stock_levels(owner, product).await.unwrap().unwrap();
        assert_eq!(counters, StockCounters::new(5, 0));
        assert!(store
            .active_by_source("live-cart", "row-1", owner)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn dropping_an_uncommitted_transaction_rolls_back() {
        let store = InMemoryStockStore::new();
        let owner = OwnerId::new();
        let product = ProductId::new();
        store.seed_product(owner, product, 5, 0).await;

        {
            let mut tx = store.begin().await.unwrap();
            tx.write_stock(owner, product, StockCounters::new(1, 1))
                .await
                .unwrap();
            // Dropped without commit.
        }

        let counters = store.stock_levels(owner, product).await.unwrap().unwrap();
        assert_eq!(counters, StockCounters::new(5, 0));
    }

    #[tokio::test]
    async fn transactions_serialize_behind_the_state_mutex() {
        let store = InMemoryStockStore::new();
        let owner = OwnerId::new();
        let product = ProductId::new();
        store.seed_product(owner, product, 1, 0).await;

        let tx = store.begin().await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(25),
            store.begin(),
        )
        .await;
        assert!(blocked.is_err(), "second begin must block until commit");
        tx.commit().await.unwrap();
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn terminal_reservations_reject_further_transitions() {
        let store = InMemoryStockStore::new();
        let owner = OwnerId::new();
        let product = ProductId::new();
        store.seed_product(owner, product, 5, 0).await;

        let mut tx = store.begin().await.unwrap();
        let reservation = tx
            .insert_reservation(new_reservation(owner, product, 2), Utc::now())
            .await
            .unwrap();
        tx.mark_committed(reservation.id, owner, Utc::now())
            .await
            .unwrap();
        let err = tx
            .mark_released(reservation.id, owner, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StockError::InvalidReservationState {
                status: ReservationStatus::Committed,
                ..
            }
        ));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn injected_ledger_failure_hits_exactly_once() {
        let store = InMemoryStockStore::new();
        let owner = OwnerId::new();
        let product = ProductId::new();
        store.seed_product(owner, product, 5, 0).await;
        store.fail_next_movement();

        let movement = NewMovement {
            owner_id: owner,
            product_id: product,
            kind: MovementKind::Reserve,
            qty: 1,
            source: "live-cart".to_string(),
            source_key: "row-1".to_string(),
            metadata: serde_json::json!({}),
        };

        let mut tx = store.begin().await.unwrap();
        assert!(tx.append_movement(movement.clone(), Utc::now()).await.is_err());
        assert!(tx.append_movement(movement, Utc::now()).await.is_ok());
        tx.commit().await.unwrap();

        assert_eq!(store.movements().await.len(), 1);
    }
}
