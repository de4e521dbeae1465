//! Movement ledger types.
//!
//! The ledger is an append-only audit trail of every stock-affecting event.
//! It exists for reconciliation and diagnostics; the authoritative state is
//! always the product counters and reservation rows. Ledger writes are
//! best-effort: a failed append is logged and never fails the primary
//! mutation (see [`crate::store::StockTx::append_movement`]).

use crate::types::{OwnerId, ProductId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a stock movement, as recorded in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    /// Direct stock increase (delivery, stocktaking correction)
    In,
    /// Direct stock decrease (damage, stocktaking correction)
    Out,
    /// Quantity held by a new reservation
    Reserve,
    /// Hold abandoned; quantity returned to the available pool
    Unreserve,
    /// Hold converted into a permanent stock deduction
    Commit,
}

impl MovementKind {
    /// Storage representation of the movement kind
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Reserve => "reserve",
            Self::Unreserve => "unreserve",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a direct stock correction.
///
/// A dedicated type (rather than reusing [`MovementKind`]) so the adjustment
/// operation can only ever be called with the two kinds that are valid for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentKind {
    /// Units entering the warehouse
    Inbound,
    /// Units leaving the warehouse outside any reservation
    Outbound,
}

impl AdjustmentKind {
    /// The ledger movement kind this adjustment records
    #[must_use]
    pub const fn movement_kind(&self) -> MovementKind {
        match self {
            Self::Inbound => MovementKind::In,
            Self::Outbound => MovementKind::Out,
        }
    }
}

/// Parameters for appending a ledger entry.
#[derive(Clone, Debug)]
pub struct NewMovement {
    /// Tenant scope
    pub owner_id: OwnerId,
    /// Product the movement affects
    pub product_id: ProductId,
    /// What happened
    pub kind: MovementKind,
    /// Moved quantity
    pub qty: u32,
    /// Originating action kind
    pub source: String,
    /// Originating action key
    pub source_key: String,
    /// Free-form context (reservation id, client id, correction reason)
    pub metadata: serde_json::Value,
}

/// A recorded ledger entry, never updated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementEntry {
    /// Tenant scope
    pub owner_id: OwnerId,
    /// Product the movement affected
    pub product_id: ProductId,
    /// What happened
    pub kind: MovementKind,
    /// Moved quantity
    pub qty: u32,
    /// Originating action kind
    pub source: String,
    /// Originating action key
    pub source_key: String,
    /// Free-form context
    pub metadata: serde_json::Value,
    /// When the entry was appended
    pub created_at: DateTime<Utc>,
}
