//! `PostgreSQL`-backed stock store.
//!
//! # Concurrency
//!
//! The `*_for_update` reads issue `SELECT ... FOR UPDATE`, taking an
//! exclusive row lock that blocks concurrent transactions until commit or
//! rollback. This is the correctness boundary the engine relies on: under the
//! default `READ COMMITTED` isolation, two racing reservations serialize on
//! the counter row and the loser re-reads the updated counters instead of a
//! stale snapshot.
//!
//! # Ledger appends
//!
//! A failed statement aborts a `PostgreSQL` transaction, but the movement
//! ledger is best-effort by contract. [`StockTx::append_movement`] therefore
//! wraps the insert in a savepoint: on failure the transaction rolls back to
//! the savepoint and stays usable, and the engine just logs the lost entry.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use stockhold_core::error::{Result, StockError};
use stockhold_core::ledger::{MovementEntry, MovementKind, NewMovement};
use stockhold_core::store::{StockStore, StockTx};
use stockhold_core::types::{
    ClientId, NewReservation, OwnerId, ProductId, Reservation, ReservationId, ReservationStatus,
    StockCounters,
};
use uuid::Uuid;

use crate::config::PostgresConfig;

/// Production stock store over a `PostgreSQL` connection pool.
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    /// Connect a new pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Storage`] if the pool cannot be established.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Duration::from_secs(config.idle_timeout))
            .connect(&config.url)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to connect to PostgreSQL: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying connection pool.
    ///
    /// Useful for health checks or for sharing the pool with the advisory
    /// lock coordinator.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Storage`] if a migration fails.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to run migrations: {e}")))
    }
}

struct PostgresStockTx {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: Uuid,
    owner_id: Uuid,
    product_id: Uuid,
    client_id: Uuid,
    qty: i64,
    status: String,
    source: String,
    source_key: String,
    reserved_at: DateTime<Utc>,
    committed_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
}

impl ReservationRow {
    fn into_reservation(self) -> Result<Reservation> {
        Ok(Reservation {
            id: ReservationId::from_uuid(self.id),
            product_id: ProductId::from_uuid(self.product_id),
            client_id: ClientId::from_uuid(self.client_id),
            owner_id: OwnerId::from_uuid(self.owner_id),
            qty: qty_from_db(self.qty)?,
            status: status_from_db(&self.status)?,
            source: self.source,
            source_key: self.source_key,
            reserved_at: self.reserved_at,
            committed_at: self.committed_at,
            released_at: self.released_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MovementRow {
    owner_id: Uuid,
    product_id: Uuid,
    kind: String,
    qty: i64,
    source: String,
    source_key: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl MovementRow {
    fn into_entry(self) -> Result<MovementEntry> {
        Ok(MovementEntry {
            owner_id: OwnerId::from_uuid(self.owner_id),
            product_id: ProductId::from_uuid(self.product_id),
            kind: kind_from_db(&self.kind)?,
            qty: qty_from_db(self.qty)?,
            source: self.source,
            source_key: self.source_key,
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}

const RESERVATION_COLUMNS: &str = "id, owner_id, product_id, client_id, qty, status, \
     source, source_key, reserved_at, committed_at, released_at";

fn status_from_db(raw: &str) -> Result<ReservationStatus> {
    match raw {
        "reserved" => Ok(ReservationStatus::Reserved),
        "committed" => Ok(ReservationStatus::Committed),
        "released" => Ok(ReservationStatus::Released),
        other => Err(StockError::Storage(format!(
            "unknown reservation status '{other}' in storage"
        ))),
    }
}

fn kind_from_db(raw: &str) -> Result<MovementKind> {
    match raw {
        "in" => Ok(MovementKind::In),
        "out" => Ok(MovementKind::Out),
        "reserve" => Ok(MovementKind::Reserve),
        "unreserve" => Ok(MovementKind::Unreserve),
        "commit" => Ok(MovementKind::Commit),
        other => Err(StockError::Storage(format!(
            "unknown movement kind '{other}' in storage"
        ))),
    }
}

fn qty_from_db(raw: i64) -> Result<u32> {
    u32::try_from(raw)
        .map_err(|_| StockError::Storage(format!("quantity {raw} out of range in storage")))
}

fn counters_from_db(stock: i64, reserved: i64) -> Result<StockCounters> {
    Ok(StockCounters::new(qty_from_db(stock)?, qty_from_db(reserved)?))
}

/// Shared guarded-update for the two one-way transitions. The `status =
/// 'reserved'` predicate enforces the state machine at the storage layer; a
/// zero-row update is disambiguated into not-found versus already-terminal.
async fn mark_transition(
    tx: &mut Transaction<'static, Postgres>,
    reservation_id: ReservationId,
    owner_id: OwnerId,
    target: ReservationStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = match target {
        ReservationStatus::Committed => {
            "UPDATE stock_reservations
             SET status = 'committed', committed_at = $3
             WHERE id = $1 AND owner_id = $2 AND status = 'reserved'"
        }
        ReservationStatus::Released => {
            "UPDATE stock_reservations
             SET status = 'released', released_at = $3
             WHERE id = $1 AND owner_id = $2 AND status = 'reserved'"
        }
        ReservationStatus::Reserved => {
            return Err(StockError::Storage(
                "reservations are never transitioned back to reserved".to_string(),
            ));
        }
    };

    let result = sqlx::query(sql)
        .bind(reservation_id.as_uuid())
        .bind(owner_id.as_uuid())
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(|e| StockError::Storage(format!("Failed to transition reservation: {e}")))?;

    if result.rows_affected() == 0 {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM stock_reservations WHERE id = $1 AND owner_id = $2",
        )
        .bind(reservation_id.as_uuid())
        .bind(owner_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StockError::Storage(format!("Failed to read reservation status: {e}")))?;

        return match row {
            Some((raw,)) => {
                let status = status_from_db(&raw)?;
                Err(StockError::InvalidReservationState {
                    reservation_id,
                    status,
                })
            }
            None => Err(StockError::ReservationNotFound { reservation_id }),
        };
    }
    Ok(())
}

impl StockTx for PostgresStockTx {
    fn stock_for_update(
        &mut self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<StockCounters>> + Send + '_>> {
        Box::pin(async move {
            let row: Option<(i64, i64)> = sqlx::query_as(
                "SELECT stock, reserved FROM product_stock
                 WHERE owner_id = $1 AND product_id = $2
                 FOR UPDATE",
            )
            .bind(owner_id.as_uuid())
            .bind(product_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to lock stock counters: {e}")))?;

            match row {
                Some((stock, reserved)) => counters_from_db(stock, reserved),
                None => Err(StockError::ProductNotFound {
                    product_id,
                    owner_id,
                }),
            }
        })
    }

    fn write_stock(
        &mut self,
        owner_id: OwnerId,
        product_id: ProductId,
        counters: StockCounters,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE product_stock
                 SET stock = $3, reserved = $4, updated_at = NOW()
                 WHERE owner_id = $1 AND product_id = $2",
            )
            .bind(owner_id.as_uuid())
            .bind(product_id.as_uuid())
            .bind(i64::from(counters.stock))
            .bind(i64::from(counters.reserved))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to write stock counters: {e}")))?;

            if result.rows_affected() == 0 {
                return Err(StockError::ProductNotFound {
                    product_id,
                    owner_id,
                });
            }
            Ok(())
        })
    }

    fn insert_reservation(
        &mut self,
        new: NewReservation,
        reserved_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Reservation>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO stock_reservations
                 (id, owner_id, product_id, client_id, qty, status, source, source_key, reserved_at)
                 VALUES ($1, $2, $3, $4, $5, 'reserved', $6, $7, $8)",
            )
            .bind(new.id.as_uuid())
            .bind(new.owner_id.as_uuid())
            .bind(new.product_id.as_uuid())
            .bind(new.client_id.as_uuid())
            .bind(i64::from(new.qty))
            .bind(&new.source)
            .bind(&new.source_key)
            .bind(reserved_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to insert reservation: {e}")))?;

            Ok(Reservation {
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
            })
        })
    }

    fn reservation_for_update(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Reservation>>> + Send + '_>> {
        Box::pin(async move {
            let row: Option<ReservationRow> = sqlx::query_as(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
                 WHERE id = $1 AND owner_id = $2
                 FOR UPDATE"
            ))
            .bind(reservation_id.as_uuid())
            .bind(owner_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to lock reservation: {e}")))?;

            row.map(ReservationRow::into_reservation).transpose()
        })
    }

    fn active_by_source_for_update<'a>(
        &'a mut self,
        source: &'a str,
        source_key: &'a str,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Reservation>>> + Send + 'a>> {
        Box::pin(async move {
            let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
                 WHERE owner_id = $1 AND source = $2 AND source_key = $3 AND status = 'reserved'
                 ORDER BY reserved_at, id
                 FOR UPDATE"
            ))
            .bind(owner_id.as_uuid())
            .bind(source)
            .bind(source_key)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| {
                StockError::Storage(format!("Failed to lock reservations by source: {e}"))
            })?;

            rows.into_iter()
                .map(ReservationRow::into_reservation)
                .collect()
        })
    }

    fn mark_committed(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
        committed_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(mark_transition(
            &mut self.tx,
            reservation_id,
            owner_id,
            ReservationStatus::Committed,
            committed_at,
        ))
    }

    fn mark_released(
        &mut self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
        released_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(mark_transition(
            &mut self.tx,
            reservation_id,
            owner_id,
            ReservationStatus::Released,
            released_at,
        ))
    }

    fn append_movement(
        &mut self,
        movement: NewMovement,
        created_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("SAVEPOINT movement_append")
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StockError::Storage(format!("Failed to open savepoint: {e}")))?;

            let inserted = sqlx::query(
                "INSERT INTO stock_movements
                 (owner_id, product_id, kind, qty, source, source_key, metadata, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(movement.owner_id.as_uuid())
            .bind(movement.product_id.as_uuid())
            .bind(movement.kind.as_str())
            .bind(i64::from(movement.qty))
            .bind(&movement.source)
            .bind(&movement.source_key)
            .bind(&movement.metadata)
            .bind(created_at)
            .execute(&mut *self.tx)
            .await;

            match inserted {
                Ok(_) => {
                    sqlx::query("RELEASE SAVEPOINT movement_append")
                        .execute(&mut *self.tx)
                        .await
                        .map_err(|e| {
                            StockError::Storage(format!("Failed to release savepoint: {e}"))
                        })?;
                    Ok(())
                }
                Err(err) => {
                    // Keep the enclosing transaction alive; the caller only
                    // logs the lost audit entry.
                    if let Err(rollback_err) = sqlx::query("ROLLBACK TO SAVEPOINT movement_append")
                        .execute(&mut *self.tx)
                        .await
                    {
                        return Err(StockError::Storage(format!(
                            "Failed to roll back movement savepoint: {rollback_err}"
                        )));
                    }
                    Err(StockError::Storage(format!(
                        "Failed to append movement: {err}"
                    )))
                }
            }
        })
    }

    fn commit(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            self.tx
                .commit()
                .await
                .map_err(|e| StockError::Storage(format!("Failed to commit transaction: {e}")))
        })
    }

    fn rollback(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            self.tx
                .rollback()
                .await
                .map_err(|e| StockError::Storage(format!("Failed to roll back transaction: {e}")))
        })
    }
}

impl StockStore for PostgresStockStore {
    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<Box<dyn StockTx>>> + Send + '_>> {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StockError::Storage(format!("Failed to begin transaction: {e}")))?;
            Ok(Box::new(PostgresStockTx { tx }) as Box<dyn StockTx>)
        })
    }

    fn stock_levels(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StockCounters>>> + Send + '_>> {
        Box::pin(async move {
            let row: Option<(i64, i64)> = sqlx::query_as(
                "SELECT stock, reserved FROM product_stock
                 WHERE owner_id = $1 AND product_id = $2",
            )
            .bind(owner_id.as_uuid())
            .bind(product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to read stock counters: {e}")))?;

            row.map(|(stock, reserved)| counters_from_db(stock, reserved))
                .transpose()
        })
    }

    fn reservation(
        &self,
        reservation_id: ReservationId,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Reservation>>> + Send + '_>> {
        Box::pin(async move {
            let row: Option<ReservationRow> = sqlx::query_as(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
                 WHERE id = $1 AND owner_id = $2"
            ))
            .bind(reservation_id.as_uuid())
            .bind(owner_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to read reservation: {e}")))?;

            row.map(ReservationRow::into_reservation).transpose()
        })
    }

    fn active_by_source<'a>(
        &'a self,
        source: &'a str,
        source_key: &'a str,
        owner_id: OwnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Reservation>>> + Send + 'a>> {
        Box::pin(async move {
            let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM stock_reservations
                 WHERE owner_id = $1 AND source = $2 AND source_key = $3 AND status = 'reserved'
                 ORDER BY reserved_at, id"
            ))
            .bind(owner_id.as_uuid())
            .bind(source)
            .bind(source_key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                StockError::Storage(format!("Failed to read reservations by source: {e}"))
            })?;

            rows.into_iter()
                .map(ReservationRow::into_reservation)
                .collect()
        })
    }

    fn movements_for_product(
        &self,
        owner_id: OwnerId,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MovementEntry>>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<MovementRow> = sqlx::query_as(
                "SELECT owner_id, product_id, kind, qty, source, source_key, metadata, created_at
                 FROM stock_movements
                 WHERE owner_id = $1 AND product_id = $2
                 ORDER BY created_at, id",
            )
            .bind(owner_id.as_uuid())
            .bind(product_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StockError::Storage(format!("Failed to read movements: {e}")))?;

            rows.into_iter().map(MovementRow::into_entry).collect()
        })
    }
}
