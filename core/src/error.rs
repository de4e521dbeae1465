//! Error taxonomy for stock reservation operations.

use crate::types::{OwnerId, ProductId, ReservationId, ReservationStatus};
use thiserror::Error;

/// Result type alias for stock reservation operations.
pub type Result<T> = std::result::Result<T, StockError>;

/// Failure modes of the public engine operations.
///
/// Every public operation returns one of these as an explicit typed failure;
/// nothing is swallowed except movement-ledger appends (logged, diagnostic
/// only). Callers map `InsufficientStock` to a sold-out message and
/// `LockTimeout` to a generic "please retry" message, since a lock timeout is a
/// contention fact, not a stock fact.
#[derive(Debug, Error)]
pub enum StockError {
    /// Unknown product or tenant mismatch; not retryable without caller
    /// correction.
    #[error("product {product_id} not found for owner {owner_id}")]
    ProductNotFound {
        /// The product that was requested
        product_id: ProductId,
        /// The tenant it was requested for
        owner_id: OwnerId,
    },

    /// The per-product advisory lock could not be acquired within its timeout.
    ///
    /// Transient contention; retryable with backoff (see
    /// [`StockError::is_retryable`]).
    #[error("timed out waiting for the stock lock on product {product_id}")]
    LockTimeout {
        /// The contended product
        product_id: ProductId,
    },

    /// Not enough available units to satisfy the request.
    ///
    /// A business fact, surfaced to the end user; never silently retried.
    #[error(
        "insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        /// The product that ran short
        product_id: ProductId,
        /// Units the caller asked for
        requested: u32,
        /// Units actually available at validation time
        available: u32,
    },

    /// Commit/release was driven by raw id against a reservation already in a
    /// terminal state.
    ///
    /// Indicates a caller bug; the `*_by_source_key` operations exist to make
    /// retried requests safe.
    #[error("reservation {reservation_id} is already {status}")]
    InvalidReservationState {
        /// The reservation that was targeted
        reservation_id: ReservationId,
        /// Its current (terminal) status
        status: ReservationStatus,
    },

    /// Unknown reservation id or tenant mismatch.
    #[error("reservation {reservation_id} not found")]
    ReservationNotFound {
        /// The reservation that was requested
        reservation_id: ReservationId,
    },

    /// A zero quantity was requested; reservations and adjustments must move a
    /// positive number of units.
    #[error("quantity must be positive")]
    InvalidQuantity,

    /// Counter drift detected: a decrement would have driven a counter
    /// negative.
    ///
    /// The engine validates against freshly row-locked counters, so this is
    /// unreachable through the public operations; if it ever fires, the stored
    /// counters no longer match the reservation rows and the transaction is
    /// rolled back instead of silently flooring the counter.
    #[error("stock counter drift on product {product_id}: {detail}")]
    InvariantViolation {
        /// The product whose counters drifted
        product_id: ProductId,
        /// What the engine was about to do when it noticed
        detail: String,
    },

    /// Underlying data-store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StockError {
    /// Whether a caller may retry the failed operation with backoff.
    ///
    /// Only lock timeouts are retryable: they are contention facts, not
    /// business facts. Retrying `InsufficientStock` would spam a sold-out
    /// product, and the remaining variants indicate caller or system bugs.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_timeouts_are_retryable() {
        let timeout = StockError::LockTimeout {
            product_id: ProductId::new(),
        };
        assert!(timeout.is_retryable());

        let sold_out = StockError::InsufficientStock {
            product_id: ProductId::new(),
            requested: 3,
            available: 1,
        };
        assert!(!sold_out.is_retryable());
        assert!(!StockError::InvalidQuantity.is_retryable());
    }

    #[test]
    fn invalid_state_names_the_terminal_status() {
        let err = StockError::InvalidReservationState {
            reservation_id: ReservationId::new(),
            status: ReservationStatus::Committed,
        };
        assert!(err.to_string().contains("already committed"));
    }
}
