use thiserror::Error;

use pharmaflow_core::{LotId, ProductId};

/// Expected business outcomes of ledger operations, returned as values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("product {0} is not stocked")]
    ProductNotFound(ProductId),

    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: u64, available: u64 },

    #[error("insufficient reserved stock: requested {requested}, reserved {reserved}")]
    InsufficientReservedStock { requested: u64, reserved: u64 },

    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("lot {0} not found")]
    LotNotFound(LotId),

    #[error("lot {lot_id} still has {reserved} units reserved")]
    LotHasReservations { lot_id: LotId, reserved: u32 },

    /// Same lot id received again with different contents.
    #[error("lot {0} already exists with different contents")]
    LotAlreadyExists(LotId),

    #[error("ledger lock poisoned")]
    Poisoned,
}
