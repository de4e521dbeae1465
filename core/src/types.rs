//! Domain types for the stock reservation engine.
//!
//! This module contains the identifier newtypes, the product stock counters,
//! and the reservation entity with its one-way status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a product
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(Uuid);

impl ProductId {
    /// Creates a new random `ProductId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ProductId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a client (the viewer or operator holding a reservation)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Creates a new random `ClientId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ClientId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant scope for every operation.
///
/// The engine never infers tenancy; each caller supplies the owner explicitly
/// and rows from another tenant are treated as not found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Creates a new random `OwnerId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `OwnerId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random `ReservationId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ReservationId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Stock counters
// ============================================================================

/// Per-product stock counters.
///
/// `stock` is the total owned units; `reserved` is the portion currently held
/// by active reservations. Both are mutated exclusively through the engine,
/// which maintains `reserved <= stock` at all times.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCounters {
    /// Total owned units
    pub stock: u32,
    /// Units held by active reservations
    pub reserved: u32,
}

impl StockCounters {
    /// Creates counters from raw values
    #[must_use]
    pub const fn new(stock: u32, reserved: u32) -> Self {
        Self { stock, reserved }
    }

    /// Quantity a new reservation may still claim (`stock - reserved`, floored
    /// at zero for reads of drifted data)
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.stock.saturating_sub(self.reserved)
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Status of a reservation: a strict one-way state machine.
///
/// A reservation is born `Reserved` and transitions exactly once to either
/// `Committed` (stock permanently deducted) or `Released` (hold abandoned).
/// No transitions out of a terminal state are permitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Active hold; counts toward the product's `reserved` counter
    Reserved,
    /// Converted into a permanent stock deduction
    Committed,
    /// Abandoned without deducting stock
    Released,
}

impl ReservationStatus {
    /// Storage representation of the status
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }

    /// Whether the status permits no further transitions
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Released)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A temporary hold of quantity against a product on behalf of a client.
///
/// The `source` / `source_key` pair identifies the originating business action
/// (a live-cart row, an order line, an admin correction) and is the idempotency
/// key for the `*_by_source_key` engine operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique identifier, assigned at creation, immutable
    pub id: ReservationId,
    /// Product the quantity is held against
    pub product_id: ProductId,
    /// Client holding the reservation
    pub client_id: ClientId,
    /// Tenant scope
    pub owner_id: OwnerId,
    /// Held quantity, positive, immutable after creation
    pub qty: u32,
    /// Current lifecycle status
    pub status: ReservationStatus,
    /// Originating action kind (e.g. `"live-cart"`, `"order-item"`)
    pub source: String,
    /// Originating action key within `source` (e.g. a cart row id)
    pub source_key: String,
    /// When the hold was taken
    pub reserved_at: DateTime<Utc>,
    /// Set exactly once, when the reservation is committed
    pub committed_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the reservation is released
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Whether this reservation still holds quantity against its product
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, ReservationStatus::Reserved)
    }
}

/// Parameters for creating a reservation row.
///
/// The id is generated by the engine before the insert so in-memory and
/// database stores behave identically.
#[derive(Clone, Debug)]
pub struct NewReservation {
    /// Pre-generated reservation id
    pub id: ReservationId,
    /// Product the quantity is held against
    pub product_id: ProductId,
    /// Client taking the hold
    pub client_id: ClientId,
    /// Tenant scope
    pub owner_id: OwnerId,
    /// Quantity to hold, positive
    pub qty: u32,
    /// Originating action kind
    pub source: String,
    /// Originating action key
    pub source_key: String,
}
