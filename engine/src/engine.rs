//! The stock reservation orchestrator.
//!
//! `StockEngine` composes the availability calculator, the advisory lock
//! coordinator, the transactional store, and the movement ledger into the
//! public reservation lifecycle operations.
//!
//! # Concurrency
//!
//! Two layers of mutual exclusion are combined deliberately:
//!
//! 1. The advisory per-product lock keeps concurrent callers on a hot product
//!    from piling wasted transactions onto the same row lock. It is
//!    timeout-bound and never trusted alone for correctness.
//! 2. The row-level lock taken by the `*_for_update` reads inside the
//!    transaction is the correctness boundary: counters are always re-read
//!    under it immediately before validation, in the same transaction that
//!    mutates them, so two racing reservations cannot both observe the same
//!    stale `available` value.
//!
//! Operations touching several products (`commit_many`, the source-key
//! wrappers) acquire locks in ascending product-id order so concurrent
//! batches cannot deadlock.

use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use stockhold_core::availability::{Availability, AvailabilityCalculator};
use stockhold_core::environment::Clock;
use stockhold_core::error::{Result, StockError};
use stockhold_core::ledger::{AdjustmentKind, MovementKind, NewMovement};
use stockhold_core::lock::{LockCoordinator, LockToken};
use stockhold_core::store::{StockStore, StockTx};
use stockhold_core::types::{
    ClientId, NewReservation, OwnerId, ProductId, Reservation, ReservationId, StockCounters,
};

/// The stock reservation engine.
///
/// The only component allowed to mutate product counters and reservation
/// rows. Holds no mutable state of its own, just handles to the injected
/// store, lock coordinator, and clock, so a single instance is shared freely
/// across request handlers.
#[derive(Clone)]
pub struct StockEngine {
    store: Arc<dyn StockStore>,
    locks: Arc<dyn LockCoordinator>,
    clock: Arc<dyn Clock>,
    availability: AvailabilityCalculator,
    config: EngineConfig,
}

impl StockEngine {
    /// Creates an engine with the default configuration
    #[must_use]
    pub fn new(
        store: Arc<dyn StockStore>,
        locks: Arc<dyn LockCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_config(store, locks, clock, EngineConfig::default())
    }

    /// Creates an engine with an explicit configuration
    #[must_use]
    pub fn with_config(
        store: Arc<dyn StockStore>,
        locks: Arc<dyn LockCoordinator>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let availability = AvailabilityCalculator::new(Arc::clone(&store));
        Self {
            store,
            locks,
            clock,
            availability,
            config,
        }
    }

    /// Current counters for a product; pure read, no locks.
    ///
    /// # Errors
    ///
    /// - [`StockError::ProductNotFound`]: unknown product or tenant mismatch
    /// - [`StockError::Storage`]: backend failure
    #[tracing::instrument(skip(self))]
    pub async fn check_availability(
        &self,
        product_id: ProductId,
        owner_id: OwnerId,
    ) -> Result<Availability> {
        self.availability.check(product_id, owner_id).await
    }

    /// Take a hold of `qty` units of a product on behalf of a client.
    ///
    /// Validates `qty > 0` and `available >= qty` against freshly row-locked
    /// counters, inserts the reservation with status `reserved`, increments
    /// the `reserved` counter, and appends a `reserve` movement.
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidQuantity`]: `qty` is zero
    /// - [`StockError::LockTimeout`]: the advisory lock stayed contended
    /// - [`StockError::ProductNotFound`]: unknown product or tenant mismatch
    /// - [`StockError::InsufficientStock`]: fewer than `qty` units available
    /// - [`StockError::Storage`]: backend failure
    #[tracing::instrument(skip(self))]
    pub async fn reserve(
        &self,
        product_id: ProductId,
        client_id: ClientId,
        owner_id: OwnerId,
        qty: u32,
        source: &str,
        source_key: &str,
    ) -> Result<ReservationId> {
        if qty == 0 {
            return Err(StockError::InvalidQuantity);
        }

        let _lock = self.acquire_lock(product_id).await?;
        let now = self.clock.now();
        let new = NewReservation {
            id: ReservationId::new(),
            product_id,
            client_id,
            owner_id,
            qty,
            source: source.to_string(),
            source_key: source_key.to_string(),
        };

        let mut tx = self.store.begin().await?;
        let staged = Self::stage_reserve(tx.as_mut(), new, now).await;
        let reservation_id = Self::finish(tx, staged).await?;

        tracing::debug!(%reservation_id, "reservation taken");
        Ok(reservation_id)
    }

    /// Convert a reservation into a permanent stock deduction.
    ///
    /// Requires status `reserved`. Decrements both `stock` and `reserved` by
    /// the held quantity, transitions the reservation to `committed`, and
    /// appends a `commit` movement.
    ///
    /// # Errors
    ///
    /// - [`StockError::ReservationNotFound`]: unknown id or tenant mismatch
    /// - [`StockError::InvalidReservationState`]: the reservation is already
    ///   terminal (use [`StockEngine::commit_by_source_key`] for retry-safe
    ///   callers)
    /// - [`StockError::LockTimeout`]: the advisory lock stayed contended
    /// - [`StockError::InsufficientStock`]: `stock` dropped below the held
    ///   quantity (unreachable while the availability invariant holds, but
    ///   checked rather than assumed)
    /// - [`StockError::Storage`]: backend failure
    #[tracing::instrument(skip(self))]
    pub async fn commit(&self, reservation_id: ReservationId, owner_id: OwnerId) -> Result<()> {
        let reservation = self.fetch_reservation(reservation_id, owner_id).await?;
        if !reservation.is_active() {
            return Err(StockError::InvalidReservationState {
                reservation_id,
                status: reservation.status,
            });
        }

        let _lock = self.acquire_lock(reservation.product_id).await?;
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let staged = Self::stage_commit_by_ids(tx.as_mut(), &[reservation_id], owner_id, now).await;
        Self::finish(tx, staged).await
    }

    /// Abandon a reservation without deducting stock.
    ///
    /// Requires status `reserved`. Decrements the `reserved` counter,
    /// transitions the reservation to `released`, and appends an `unreserve`
    /// movement.
    ///
    /// # Errors
    ///
    /// - [`StockError::ReservationNotFound`]: unknown id or tenant mismatch
    /// - [`StockError::InvalidReservationState`]: the reservation is already
    ///   terminal (use [`StockEngine::release_by_source_key`] for retry-safe
    ///   callers)
    /// - [`StockError::LockTimeout`]: the advisory lock stayed contended
    /// - [`StockError::Storage`]: backend failure
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, reservation_id: ReservationId, owner_id: OwnerId) -> Result<()> {
        let reservation = self.fetch_reservation(reservation_id, owner_id).await?;
        if !reservation.is_active() {
            return Err(StockError::InvalidReservationState {
                reservation_id,
                status: reservation.status,
            });
        }

        let _lock = self.acquire_lock(reservation.product_id).await?;
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let staged =
            Self::stage_release_by_ids(tx.as_mut(), &[reservation_id], owner_id, now).await;
        Self::finish(tx, staged).await
    }

    /// Commit every active reservation created by an originating action.
    ///
    /// Idempotent: when no `reserved`-status row matches the source key the
    /// call is a silent no-op, so retried requests from flaky upstream
    /// callers are safe.
    ///
    /// # Errors
    ///
    /// - [`StockError::LockTimeout`]: an advisory lock stayed contended
    /// - [`StockError::InsufficientStock`]: a matched reservation failed the
    ///   defensive stock check; nothing is committed
    /// - [`StockError::Storage`]: backend failure
    #[tracing::instrument(skip(self))]
    pub async fn commit_by_source_key(
        &self,
        source: &str,
        source_key: &str,
        owner_id: OwnerId,
    ) -> Result<()> {
        let active = self.store.active_by_source(source, source_key, owner_id).await?;
        let Some(_locks) = self.lock_products_of(&active).await? else {
            tracing::debug!("no active reservations for source key; nothing to commit");
            return Ok(());
        };

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let staged = Self::stage_commit_by_source(tx.as_mut(), source, source_key, owner_id, now).await;
        Self::finish(tx, staged).await
    }

    /// Release every active reservation created by an originating action.
    ///
    /// Idempotent: when no `reserved`-status row matches the source key the
    /// call is a silent no-op: calling twice produces the same end state as
    /// calling once.
    ///
    /// # Errors
    ///
    /// - [`StockError::LockTimeout`]: an advisory lock stayed contended
    /// - [`StockError::Storage`]: backend failure
    #[tracing::instrument(skip(self))]
    pub async fn release_by_source_key(
        &self,
        source: &str,
        source_key: &str,
        owner_id: OwnerId,
    ) -> Result<()> {
        let active = self.store.active_by_source(source, source_key, owner_id).await?;
        let Some(_locks) = self.lock_products_of(&active).await? else {
            tracing::debug!("no active reservations for source key; nothing to release");
            return Ok(());
        };

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let staged =
            Self::stage_release_by_source(tx.as_mut(), source, source_key, owner_id, now).await;
        Self::finish(tx, staged).await
    }

    /// Commit a batch of reservations, all-or-nothing.
    ///
    /// Used by finalize-style callers closing out a live-selling batch. The
    /// distinct products touched are collected first and locked in ascending
    /// product-id order to avoid lock-ordering deadlocks; the whole batch
    /// runs in a single transaction, so if any member fails validation the
    /// entire batch rolls back and no partial state is persisted. Duplicate
    /// ids are deduplicated (first occurrence wins).
    ///
    /// # Errors
    ///
    /// Any error from [`StockEngine::commit`], for any member of the batch;
    /// on error nothing is committed.
    #[tracing::instrument(skip(self))]
    pub async fn commit_many(
        &self,
        reservation_ids: &[ReservationId],
        owner_id: OwnerId,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let ids: Vec<ReservationId> = reservation_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        // Discover the products touched so locks can be taken in order.
        let mut products = BTreeSet::new();
        for &id in &ids {
            let reservation = self.fetch_reservation(id, owner_id).await?;
            products.insert(reservation.product_id);
        }

        let _locks = self.acquire_locks(&products).await?;
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let staged = Self::stage_commit_by_ids(tx.as_mut(), &ids, owner_id, now).await;
        Self::finish(tx, staged).await
    }

    /// Apply a direct stock correction (delivery, stocktaking) bypassing
    /// reservations.
    ///
    /// An outbound adjustment is validated against `available`, not just
    /// `stock`: removing units that active reservations still hold would
    /// break `reserved <= stock` and let later commits drive the counters
    /// negative.
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidQuantity`]: `qty` is zero
    /// - [`StockError::LockTimeout`]: the advisory lock stayed contended
    /// - [`StockError::ProductNotFound`]: unknown product or tenant mismatch
    /// - [`StockError::InsufficientStock`]: outbound adjustment exceeds the
    ///   available units
    /// - [`StockError::Storage`]: backend failure
    #[tracing::instrument(skip(self))]
    pub async fn adjust_stock(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
        qty: u32,
        kind: AdjustmentKind,
        source: &str,
        source_key: &str,
    ) -> Result<()> {
        if qty == 0 {
            return Err(StockError::InvalidQuantity);
        }

        let _lock = self.acquire_lock(product_id).await?;
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let staged = Self::stage_adjust(
            tx.as_mut(),
            owner_id,
            product_id,
            qty,
            kind,
            source,
            source_key,
            now,
        )
        .await;
        Self::finish(tx, staged).await
    }

    // ========================================================================
    // Lock and transaction plumbing
    // ========================================================================

    async fn acquire_lock(&self, product_id: ProductId) -> Result<Box<dyn LockToken>> {
        Ok(self
            .locks
            .acquire(product_id, self.config.lock_timeout)
            .await?)
    }

    /// Acquire locks for a set of products in ascending product-id order,
    /// the fixed ordering that makes concurrent multi-product operations
    /// deadlock-free.
    async fn acquire_locks(
        &self,
        products: &BTreeSet<ProductId>,
    ) -> Result<Vec<Box<dyn LockToken>>> {
        let mut tokens = Vec::with_capacity(products.len());
        for &product_id in products {
            tokens.push(self.acquire_lock(product_id).await?);
        }
        Ok(tokens)
    }

    /// Lock the products of a pre-read reservation set; `None` when the set
    /// is empty (the caller short-circuits into its no-op path).
    async fn lock_products_of(
        &self,
        reservations: &[Reservation],
    ) -> Result<Option<Vec<Box<dyn LockToken>>>> {
        if reservations.is_empty() {
            return Ok(None);
        }
        let products: BTreeSet<ProductId> =
            reservations.iter().map(|r| r.product_id).collect();
        Ok(Some(self.acquire_locks(&products).await?))
    }

    async fn fetch_reservation(
        &self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
    ) -> Result<Reservation> {
        self.store
            .reservation(reservation_id, owner_id)
            .await?
            .ok_or(StockError::ReservationNotFound { reservation_id })
    }

    /// Commit the transaction on success, roll it back on failure. Rollback
    /// failures are logged: the transaction is dead either way and the staged
    /// error is the one the caller needs.
    async fn finish<T>(tx: Box<dyn StockTx>, staged: Result<T>) -> Result<T> {
        match staged {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(
                        error = %rollback_err,
                        "rollback failed after aborted stock transaction"
                    );
                }
                Err(err)
            }
        }
    }

    /// Append a ledger entry, logging failures instead of propagating them.
    /// The ledger is diagnostic; a failed append never rolls back the primary
    /// mutation.
    async fn record_movement(tx: &mut dyn StockTx, movement: NewMovement, at: DateTime<Utc>) {
        if let Err(err) = tx.append_movement(movement, at).await {
            tracing::warn!(
                error = %err,
                "movement ledger append failed; keeping the primary mutation"
            );
        }
    }

    // ========================================================================
    // Staged mutations (run inside the transactional envelope)
    // ========================================================================

    async fn stage_reserve(
        tx: &mut dyn StockTx,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> Result<ReservationId> {
        let counters = tx.stock_for_update(new.owner_id, new.product_id).await?;
        let available = counters.available();
        if available < new.qty {
            return Err(StockError::InsufficientStock {
                product_id: new.product_id,
                requested: new.qty,
                available,
            });
        }

        tx.write_stock(
            new.owner_id,
            new.product_id,
            StockCounters::new(counters.stock, counters.reserved + new.qty),
        )
        .await?;
        let reservation = tx.insert_reservation(new, now).await?;

        Self::record_movement(
            tx,
            NewMovement {
                owner_id: reservation.owner_id,
                product_id: reservation.product_id,
                kind: MovementKind::Reserve,
                qty: reservation.qty,
                source: reservation.source.clone(),
                source_key: reservation.source_key.clone(),
                metadata: json!({
                    "reservation_id": reservation.id,
                    "client_id": reservation.client_id,
                }),
            },
            now,
        )
        .await;

        Ok(reservation.id)
    }

    async fn stage_commit_by_ids(
        tx: &mut dyn StockTx,
        ids: &[ReservationId],
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows = Self::lock_rows(tx, ids, owner_id).await?;
        Self::stage_commit_rows(tx, &rows, owner_id, now).await
    }

    async fn stage_release_by_ids(
        tx: &mut dyn StockTx,
        ids: &[ReservationId],
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows = Self::lock_rows(tx, ids, owner_id).await?;
        Self::stage_release_rows(tx, &rows, owner_id, now).await
    }

    async fn stage_commit_by_source(
        tx: &mut dyn StockTx,
        source: &str,
        source_key: &str,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows = tx
            .active_by_source_for_update(source, source_key, owner_id)
            .await?;
        // Raced to terminal by another caller between the pre-read and the
        // row lock: the idempotent contract makes that a no-op.
        if rows.is_empty() {
            return Ok(());
        }
        Self::stage_commit_rows(tx, &rows, owner_id, now).await
    }

    async fn stage_release_by_source(
        tx: &mut dyn StockTx,
        source: &str,
        source_key: &str,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows = tx
            .active_by_source_for_update(source, source_key, owner_id)
            .await?;
        if rows.is_empty() {
            return Ok(());
        }
        Self::stage_release_rows(tx, &rows, owner_id, now).await
    }

    /// Re-read a set of reservations under row locks and require every one of
    /// them to still be active.
    async fn lock_rows(
        tx: &mut dyn StockTx,
        ids: &[ReservationId],
        owner_id: OwnerId,
    ) -> Result<Vec<Reservation>> {
        let mut rows = Vec::with_capacity(ids.len());
        for &reservation_id in ids {
            let row = tx
                .reservation_for_update(reservation_id, owner_id)
                .await?
                .ok_or(StockError::ReservationNotFound { reservation_id })?;
            if !row.is_active() {
                return Err(StockError::InvalidReservationState {
                    reservation_id,
                    status: row.status,
                });
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Lock the counters of every product in the row set (ascending order)
    /// and return them keyed by product.
    async fn lock_counters(
        tx: &mut dyn StockTx,
        rows: &[Reservation],
        owner_id: OwnerId,
    ) -> Result<BTreeMap<ProductId, StockCounters>> {
        let products: BTreeSet<ProductId> = rows.iter().map(|r| r.product_id).collect();
        let mut counters = BTreeMap::new();
        for product_id in products {
            counters.insert(product_id, tx.stock_for_update(owner_id, product_id).await?);
        }
        Ok(counters)
    }

    async fn stage_commit_rows(
        tx: &mut dyn StockTx,
        rows: &[Reservation],
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut counters = Self::lock_counters(tx, rows, owner_id).await?;

        for row in rows {
            let current = counters.get_mut(&row.product_id).ok_or_else(|| {
                StockError::Storage(format!(
                    "counters for product {} vanished mid-transaction",
                    row.product_id
                ))
            })?;
            if current.stock < row.qty {
                return Err(StockError::InsufficientStock {
                    product_id: row.product_id,
                    requested: row.qty,
                    available: current.stock,
                });
            }
            let Some(reserved) = current.reserved.checked_sub(row.qty) else {
                tracing::error!(
                    product_id = %row.product_id,
                    reservation_id = %row.id,
                    "reserved counter underflow during commit"
                );
                return Err(StockError::InvariantViolation {
                    product_id: row.product_id,
                    detail: format!(
                        "committing {} units found only {} reserved",
                        row.qty, current.reserved
                    ),
                });
            };
            current.stock -= row.qty;
            current.reserved = reserved;

            tx.mark_committed(row.id, owner_id, now).await?;
            Self::record_movement(
                tx,
                NewMovement {
                    owner_id,
                    product_id: row.product_id,
                    kind: MovementKind::Commit,
                    qty: row.qty,
                    source: row.source.clone(),
                    source_key: row.source_key.clone(),
                    metadata: json!({
                        "reservation_id": row.id,
                        "client_id": row.client_id,
                    }),
                },
                now,
            )
            .await;
        }

        for (product_id, current) in &counters {
            tx.write_stock(owner_id, *product_id, *current).await?;
        }
        Ok(())
    }

    async fn stage_release_rows(
        tx: &mut dyn StockTx,
        rows: &[Reservation],
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut counters = Self::lock_counters(tx, rows, owner_id).await?;

        for row in rows {
            let current = counters.get_mut(&row.product_id).ok_or_else(|| {
                StockError::Storage(format!(
                    "counters for product {} vanished mid-transaction",
                    row.product_id
                ))
            })?;
            let Some(reserved) = current.reserved.checked_sub(row.qty) else {
                tracing::error!(
                    product_id = %row.product_id,
                    reservation_id = %row.id,
                    "reserved counter underflow during release"
                );
                return Err(StockError::InvariantViolation {
                    product_id: row.product_id,
                    detail: format!(
                        "releasing {} units found only {} reserved",
                        row.qty, current.reserved
                    ),
                });
            };
            current.reserved = reserved;

            tx.mark_released(row.id, owner_id, now).await?;
            Self::record_movement(
                tx,
                NewMovement {
                    owner_id,
                    product_id: row.product_id,
                    kind: MovementKind::Unreserve,
                    qty: row.qty,
                    source: row.source.clone(),
                    source_key: row.source_key.clone(),
                    metadata: json!({
                        "reservation_id": row.id,
                        "client_id": row.client_id,
                    }),
                },
                now,
            )
            .await;
        }

        for (product_id, current) in &counters {
            tx.write_stock(owner_id, *product_id, *current).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage_adjust(
        tx: &mut dyn StockTx,
        owner_id: OwnerId,
        product_id: ProductId,
        qty: u32,
        kind: AdjustmentKind,
        source: &str,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let counters = tx.stock_for_update(owner_id, product_id).await?;
        let stock = match kind {
            AdjustmentKind::Inbound => {
                counters.stock.checked_add(qty).ok_or_else(|| {
                    StockError::InvariantViolation {
                        product_id,
                        detail: format!(
                            "inbound adjustment of {qty} units would overflow the stock counter"
                        ),
                    }
                })?
            }
            AdjustmentKind::Outbound => {
                let available = counters.available();
                if available < qty {
                    return Err(StockError::InsufficientStock {
                        product_id,
                        requested: qty,
                        available,
                    });
                }
                counters.stock - qty
            }
        };

        tx.write_stock(owner_id, product_id, StockCounters::new(stock, counters.reserved))
            .await?;
        Self::record_movement(
            tx,
            NewMovement {
                owner_id,
                product_id,
                kind: kind.movement_kind(),
                qty,
                source: source.to_string(),
                source_key: source_key.to_string(),
                metadata: json!({ "adjustment": kind }),
            },
            now,
        )
        .await;
        Ok(())
    }
}
