//! Inventory domain module.
//!
//! Lots and their counters, the lot-selection policy and the ledger's error
//! and outcome types. Pure domain logic: the concurrent ledger that owns the
//! lots lives in `pharmaflow-infra`.

pub mod allocation;
pub mod error;
pub mod idempotency;
pub mod lot;
pub mod view;

pub use allocation::{Allocation, plan_reservation, plan_reserved_draw, sort_fefo};
pub use error::LedgerError;
pub use idempotency::{IdempotencyKey, LedgerOperation};
pub use lot::InventoryLot;
pub use view::{LedgerOutcome, LotView, StockTotals};

pub use pharmaflow_events::{InventoryChanged, StockChangeKind};
