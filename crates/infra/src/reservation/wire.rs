//! JSON bodies of `POST /inventory/{reserve,release,debit}`.
//!
//! Shared by the HTTP client and the API handlers so both sides agree on one
//! shape.

use serde::{Deserialize, Serialize};

use pharmaflow_core::{OrderId, ProductId};
use pharmaflow_inventory::LedgerOutcome;
use pharmaflow_orders::LineDiagnostic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRequest {
    pub items: Vec<StockItem>,
    /// Makes the call idempotent per order when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
}

impl StockRequest {
    pub fn single(order_id: OrderId, product_id: ProductId, quantity: u32) -> Self {
        Self {
            items: vec![StockItem {
                product_id,
                quantity,
            }],
            order_id: Some(order_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<LedgerOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<LineDiagnostic>,
}

impl StockResponse {
    pub fn applied(outcomes: Vec<LedgerOutcome>) -> Self {
        Self {
            success: true,
            outcomes,
            error: None,
            message: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn rejected(message: impl Into<String>, diagnostics: Vec<LineDiagnostic>) -> Self {
        Self {
            success: false,
            outcomes: Vec::new(),
            error: Some("insufficient_stock".to_string()),
            message: Some(message.into()),
            diagnostics,
        }
    }
}
