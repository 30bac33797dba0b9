use serde::{Deserialize, Serialize};

use pharmaflow_core::ProductId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineProblem {
    NotFound,
    InvalidPrice,
    InsufficientStock,
}

/// Why one order line blocks confirmation.
///
/// A rejected confirmation carries one of these per problematic line so the
/// client can fix everything in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDiagnostic {
    pub product_id: ProductId,
    pub problem: LineProblem,
    pub requested: u64,
    pub available: u64,
}

impl LineDiagnostic {
    pub fn not_found(product_id: ProductId, requested: u64) -> Self {
        Self {
            product_id,
            problem: LineProblem::NotFound,
            requested,
            available: 0,
        }
    }

    pub fn invalid_price(product_id: ProductId, requested: u64) -> Self {
        Self {
            product_id,
            problem: LineProblem::InvalidPrice,
            requested,
            available: 0,
        }
    }

    pub fn insufficient_stock(product_id: ProductId, requested: u64, available: u64) -> Self {
        Self {
            product_id,
            problem: LineProblem::InsufficientStock,
            requested,
            available,
        }
    }
}

/// Local reasons an order cannot be confirmed, checked before any stock is
/// touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmRejection {
    NoItems,
    MissingCustomer,
    NotDraft,
}

impl core::fmt::Display for ConfirmRejection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfirmRejection::NoItems => f.write_str("cannot confirm order without items"),
            ConfirmRejection::MissingCustomer => {
                f.write_str("cannot confirm order without a customer")
            }
            ConfirmRejection::NotDraft => f.write_str("only draft orders can be confirmed"),
        }
    }
}
