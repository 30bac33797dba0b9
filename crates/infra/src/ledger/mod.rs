//! Authoritative stock counters.
//!
//! [`StockLedger`] is the seam the rest of the system talks to: the
//! reservation client, choreography handlers and the HTTP surface all go
//! through it. [`InMemoryLedger`] is the single-process implementation.

pub mod in_memory;

use std::sync::Arc;

use serde::Serialize;

use pharmaflow_core::{LotId, ProductId};
use pharmaflow_inventory::{
    IdempotencyKey, InventoryChanged, InventoryLot, LedgerError, LedgerOutcome, LotView,
    StockTotals,
};

pub use in_memory::InMemoryLedger;

/// Receives one `InventoryChanged` per applied mutation.
///
/// Called after the ledger has released its locks. Implementations must not
/// block for long; failures are theirs to log.
pub trait InventoryChangePublisher: Send + Sync {
    fn publish_change(&self, change: InventoryChanged);
}

/// All lots of one product, for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub totals: StockTotals,
    pub lots: Vec<LotView>,
}

pub trait StockLedger: Send + Sync {
    /// Ingest a lot. Receiving the same lot id again is `AlreadyApplied`.
    fn receive_lot(&self, lot: InventoryLot) -> Result<LedgerOutcome, LedgerError>;

    /// Drop a lot that holds no reservations.
    fn remove_lot(&self, lot_id: LotId) -> Result<LotView, LedgerError>;

    /// Every lot of the product; empty when not stocked.
    fn get_availability(&self, product_id: &ProductId) -> Result<Vec<LotView>, LedgerError>;

    /// A keyed reserve is `AlreadyApplied` when the order already holds the
    /// product, or when its reservation was debited or cancelled.
    fn reserve(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError>;

    /// With a key, returns units the order holds under its reservation. A
    /// cancel key also settles the order for that product.
    fn release(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError>;

    fn debit(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError>;

    fn snapshot(&self) -> Result<Vec<ProductStock>, LedgerError>;
}

impl<L> StockLedger for Arc<L>
where
    L: StockLedger + ?Sized,
{
    fn receive_lot(&self, lot: InventoryLot) -> Result<LedgerOutcome, LedgerError> {
        (**self).receive_lot(lot)
    }

    fn remove_lot(&self, lot_id: LotId) -> Result<LotView, LedgerError> {
        (**self).remove_lot(lot_id)
    }

    fn get_availability(&self, product_id: &ProductId) -> Result<Vec<LotView>, LedgerError> {
        (**self).get_availability(product_id)
    }

    fn reserve(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError> {
        (**self).reserve(product_id, quantity, key)
    }

    fn release(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError> {
        (**self).release(product_id, quantity, key)
    }

    fn debit(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError> {
        (**self).debit(product_id, quantity, key)
    }

    fn snapshot(&self) -> Result<Vec<ProductStock>, LedgerError> {
        (**self).snapshot()
    }
}
