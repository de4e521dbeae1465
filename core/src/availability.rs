//! Availability reads.
//!
//! A pure read over the product counters; never takes locks and never
//! mutates. The number it reports is advisory by nature: only a
//! [`StockTx::stock_for_update`](crate::store::StockTx::stock_for_update)
//! re-read inside a transaction is authoritative for a mutation.

use crate::error::{Result, StockError};
use crate::store::StockStore;
use crate::types::{OwnerId, ProductId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Snapshot of a product's counters at read time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Total owned units
    pub stock: u32,
    /// Units held by active reservations
    pub reserved: u32,
    /// Units a new reservation may still claim (`stock - reserved`, floored
    /// at zero)
    pub available: u32,
}

/// Derives `available = stock - reserved` for a product.
#[derive(Clone)]
pub struct AvailabilityCalculator {
    store: Arc<dyn StockStore>,
}

impl AvailabilityCalculator {
    /// Creates a calculator over the given store
    #[must_use]
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }

    /// Read the current counters for a product.
    ///
    /// # Errors
    ///
    /// - [`StockError::ProductNotFound`]: no counter row for this product and
    ///   owner
    /// - [`StockError::Storage`]: backend failure
    pub async fn check(&self, product_id: ProductId, owner_id: OwnerId) -> Result<Availability> {
        let counters = self
            .store
            .stock_levels(owner_id, product_id)
            .await?
            .ok_or(StockError::ProductNotFound {
                product_id,
                owner_id,
            })?;

        Ok(Availability {
            stock: counters.stock,
            reserved: counters.reserved,
            available: counters.available(),
        })
    }
}
