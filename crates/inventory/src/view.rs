use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use pharmaflow_core::{LotId, WarehouseId};

/// Read-only projection of one lot, as returned by `GetAvailability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotView {
    pub lot_id: LotId,
    pub warehouse_id: Option<WarehouseId>,
    pub aisle: Option<String>,
    pub shelf: Option<String>,
    pub quantity_available: u32,
    pub quantity_reserved: u32,
    pub expiration_date: NaiveDate,
    pub requires_cold_chain: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTotals {
    pub available: u64,
    pub reserved: u64,
}

impl StockTotals {
    pub fn of(lots: &[LotView]) -> Self {
        lots.iter().fold(Self::default(), |acc, lot| Self {
            available: acc.available + u64::from(lot.quantity_available),
            reserved: acc.reserved + u64::from(lot.quantity_reserved),
        })
    }
}

/// Result of a successful (non-error) ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Applied,
    /// The idempotency key was seen before; nothing changed.
    AlreadyApplied,
}
