//! Reservation Client: the order side's view of the ledger.
//!
//! Reserving an order is all-or-nothing across its lines. Each line is
//! reserved on its own under the order's idempotency key; when any line
//! fails, the lines reserved by this call are released again before the
//! error is returned. The caller therefore only ever sees "everything
//! reserved" or "nothing changed".

pub mod http;
pub mod local;
pub mod wire;

use async_trait::async_trait;
use thiserror::Error;

use pharmaflow_core::{OrderId, ProductId};
use pharmaflow_events::LineQuantity;
use pharmaflow_orders::LineDiagnostic;

pub use http::HttpReservationClient;
pub use local::LocalReservationClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    /// One or more lines cannot be served; nothing stays reserved.
    #[error("{} line(s) rejected by inventory", .0.len())]
    Rejected(Vec<LineDiagnostic>),
    /// The ledger could not be reached or failed internally; retry later.
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ReservationClient: Send + Sync {
    async fn reserve_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError>;

    async fn release_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError>;

    async fn debit_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError>;
}

/// Merge lines naming the same product, keeping first-seen order.
///
/// A keyed reservation is remembered per (order, product), so two lines for
/// one product must travel as a single request.
pub(crate) fn coalesce(lines: &[LineQuantity]) -> Vec<(ProductId, u32)> {
    let mut merged: Vec<(ProductId, u32)> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|(p, _)| *p == line.product_id) {
            Some((_, qty)) => *qty = qty.saturating_add(line.quantity),
            None => merged.push((line.product_id.clone(), line.quantity)),
        }
    }
    merged.retain(|(_, qty)| *qty > 0);
    merged
}
