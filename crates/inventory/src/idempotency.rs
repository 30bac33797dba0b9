use serde::{Deserialize, Serialize};

use pharmaflow_core::OrderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOperation {
    Reserve,
    Debit,
    /// Final release of an order's reservation. Once recorded, the order can
    /// no longer reserve that product.
    Cancel,
}

/// Dedupe token for ledger mutations made on behalf of an order.
///
/// The synchronous confirmation path and the asynchronous `OrderConfirmed`
/// handler both reserve under `(order, Reserve)`; whichever runs second sees
/// the key as already applied. Releasing under the reserve key returns the
/// exact lots that key allocated and reopens the key; releasing under the
/// cancel key does the same but settles the order, as does a keyed debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub order_id: OrderId,
    pub operation: LedgerOperation,
}

impl IdempotencyKey {
    pub fn reserve(order_id: OrderId) -> Self {
        Self {
            order_id,
            operation: LedgerOperation::Reserve,
        }
    }

    pub fn debit(order_id: OrderId) -> Self {
        Self {
            order_id,
            operation: LedgerOperation::Debit,
        }
    }

    pub fn cancel(order_id: OrderId) -> Self {
        Self {
            order_id,
            operation: LedgerOperation::Cancel,
        }
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let op = match self.operation {
            LedgerOperation::Reserve => "reserve",
            LedgerOperation::Debit => "debit",
            LedgerOperation::Cancel => "cancel",
        };
        write!(f, "order:{}:{}", self.order_id, op)
    }
}
