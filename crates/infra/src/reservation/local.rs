use async_trait::async_trait;
use tracing::{debug, warn};

use pharmaflow_core::{OrderId, ProductId};
use pharmaflow_events::LineQuantity;
use pharmaflow_inventory::{IdempotencyKey, LedgerError, LedgerOutcome};
use pharmaflow_orders::LineDiagnostic;

use super::{ReservationClient, ReservationError, coalesce};
use crate::ledger::StockLedger;

/// Reservation client over an in-process ledger.
///
/// The inherent `*_lines` methods also take unkeyed calls; the HTTP
/// inventory endpoints use them directly.
#[derive(Debug, Clone)]
pub struct LocalReservationClient<L> {
    ledger: L,
}

impl<L> LocalReservationClient<L>
where
    L: StockLedger,
{
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Reserve every line or none.
    ///
    /// All lines are attempted so the rejection lists every short line.
    pub fn reserve_lines(
        &self,
        order_id: Option<OrderId>,
        lines: &[(ProductId, u32)],
    ) -> Result<Vec<LedgerOutcome>, ReservationError> {
        let key = order_id.map(IdempotencyKey::reserve);
        let mut outcomes = Vec::with_capacity(lines.len());
        let mut applied: Vec<(ProductId, u32)> = Vec::new();
        let mut diagnostics = Vec::new();

        for (product_id, quantity) in lines {
            match self.ledger.reserve(product_id, *quantity, key) {
                Ok(outcome) => {
                    if outcome == LedgerOutcome::Applied {
                        applied.push((product_id.clone(), *quantity));
                    }
                    outcomes.push(outcome);
                }
                Err(LedgerError::Poisoned) => {
                    self.roll_back(key, &applied);
                    return Err(ReservationError::Unavailable(
                        LedgerError::Poisoned.to_string(),
                    ));
                }
                Err(err) => diagnostics.push(diagnose(product_id, *quantity, &err)),
            }
        }

        if diagnostics.is_empty() {
            return Ok(outcomes);
        }
        self.roll_back(key, &applied);
        Err(ReservationError::Rejected(diagnostics))
    }

    pub fn release_lines(
        &self,
        order_id: Option<OrderId>,
        lines: &[(ProductId, u32)],
    ) -> Result<Vec<LedgerOutcome>, ReservationError> {
        let key = order_id.map(IdempotencyKey::reserve);
        self.each_line(lines, |p, q| self.ledger.release(p, q, key))
    }

    pub fn debit_lines(
        &self,
        order_id: Option<OrderId>,
        lines: &[(ProductId, u32)],
    ) -> Result<Vec<LedgerOutcome>, ReservationError> {
        let key = order_id.map(IdempotencyKey::debit);
        self.each_line(lines, |p, q| self.ledger.debit(p, q, key))
    }

    fn each_line(
        &self,
        lines: &[(ProductId, u32)],
        mut op: impl FnMut(&ProductId, u32) -> Result<LedgerOutcome, LedgerError>,
    ) -> Result<Vec<LedgerOutcome>, ReservationError> {
        let mut outcomes = Vec::with_capacity(lines.len());
        let mut diagnostics = Vec::new();
        for (product_id, quantity) in lines {
            match op(product_id, *quantity) {
                Ok(outcome) => outcomes.push(outcome),
                Err(LedgerError::Poisoned) => {
                    return Err(ReservationError::Unavailable(
                        LedgerError::Poisoned.to_string(),
                    ));
                }
                Err(err) => diagnostics.push(diagnose(product_id, *quantity, &err)),
            }
        }
        if diagnostics.is_empty() {
            Ok(outcomes)
        } else {
            Err(ReservationError::Rejected(diagnostics))
        }
    }

    fn roll_back(&self, key: Option<IdempotencyKey>, applied: &[(ProductId, u32)]) {
        for (product_id, quantity) in applied {
            match self.ledger.release(product_id, *quantity, key) {
                Ok(_) => debug!(product_id = %product_id, quantity, "rolled back reservation"),
                Err(err) => warn!(
                    product_id = %product_id,
                    quantity,
                    error = %err,
                    "compensating release failed"
                ),
            }
        }
        if !applied.is_empty() {
            warn!(lines = applied.len(), "reservation rolled back");
        }
    }
}

pub(crate) fn diagnose(product_id: &ProductId, quantity: u32, err: &LedgerError) -> LineDiagnostic {
    match err {
        LedgerError::InsufficientStock {
            requested,
            available,
        } => LineDiagnostic::insufficient_stock(product_id.clone(), *requested, *available),
        LedgerError::InsufficientReservedStock {
            requested,
            reserved,
        } => LineDiagnostic::insufficient_stock(product_id.clone(), *requested, *reserved),
        LedgerError::ProductNotFound(_) => {
            LineDiagnostic::not_found(product_id.clone(), u64::from(quantity))
        }
        _ => LineDiagnostic::insufficient_stock(product_id.clone(), u64::from(quantity), 0),
    }
}

#[async_trait]
impl<L> ReservationClient for LocalReservationClient<L>
where
    L: StockLedger,
{
    async fn reserve_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError> {
        self.reserve_lines(Some(order_id), &coalesce(lines))
            .map(|_| ())
    }

    async fn release_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError> {
        self.release_lines(Some(order_id), &coalesce(lines))
            .map(|_| ())
    }

    async fn debit_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError> {
        self.debit_lines(Some(order_id), &coalesce(lines)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use pharmaflow_core::LotId;
    use pharmaflow_inventory::{InventoryLot, StockTotals};
    use pharmaflow_orders::LineProblem;

    use crate::ledger::InMemoryLedger;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, d).unwrap()
    }

    fn client() -> LocalReservationClient<Arc<InMemoryLedger>> {
        let ledger = Arc::new(InMemoryLedger::new().with_today(day(1)));
        ledger
            .receive_lot(InventoryLot::new(LotId::new(), ProductId::from("P1"), 3, day(20)))
            .unwrap();
        ledger
            .receive_lot(InventoryLot::new(LotId::new(), ProductId::from("P2"), 10, day(20)))
            .unwrap();
        LocalReservationClient::new(ledger)
    }

    fn totals(c: &LocalReservationClient<Arc<InMemoryLedger>>, p: &str) -> StockTotals {
        StockTotals::of(&c.ledger().get_availability(&ProductId::from(p)).unwrap())
    }

    fn line(p: &str, q: u32) -> LineQuantity {
        LineQuantity {
            product_id: ProductId::from(p),
            quantity: q,
        }
    }

    #[tokio::test]
    async fn short_line_rolls_back_the_others() {
        let c = client();
        let err = c
            .reserve_all(OrderId::new(), &[line("P2", 4), line("P1", 5)])
            .await
            .unwrap_err();

        let ReservationError::Rejected(diagnostics) = err else {
            panic!("expected rejection");
        };
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].product_id, ProductId::from("P1"));
        assert_eq!(diagnostics[0].problem, LineProblem::InsufficientStock);
        assert_eq!((diagnostics[0].requested, diagnostics[0].available), (5, 3));

        assert_eq!(totals(&c, "P2").available, 10);
        assert_eq!(totals(&c, "P2").reserved, 0);
    }

    #[tokio::test]
    async fn every_short_line_is_reported() {
        let c = client();
        let err = c
            .reserve_all(OrderId::new(), &[line("P1", 9), line("NOPE", 1)])
            .await
            .unwrap_err();
        let ReservationError::Rejected(diagnostics) = err else {
            panic!("expected rejection");
        };
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].problem, LineProblem::InsufficientStock);
        assert_eq!(diagnostics[1].product_id, ProductId::from("NOPE"));
        assert_eq!(diagnostics[1].problem, LineProblem::NotFound);
        assert_eq!((diagnostics[1].requested, diagnostics[1].available), (1, 0));
    }

    #[tokio::test]
    async fn product_without_lots_is_not_found() {
        let c = client();
        let lot = InventoryLot::new(LotId::new(), ProductId::from("P3"), 5, day(20));
        let lot_id = lot.lot_id();
        c.ledger().receive_lot(lot).unwrap();
        c.ledger().remove_lot(lot_id).unwrap();

        let err = c
            .reserve_all(OrderId::new(), &[line("P3", 2)])
            .await
            .unwrap_err();
        let ReservationError::Rejected(diagnostics) = err else {
            panic!("expected rejection");
        };
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].problem, LineProblem::NotFound);
        assert_eq!(diagnostics[0].requested, 2);
    }

    #[tokio::test]
    async fn repeated_reserve_for_one_order_holds_stock_once() {
        let c = client();
        let order = OrderId::new();
        c.reserve_all(order, &[line("P2", 4)]).await.unwrap();
        c.reserve_all(order, &[line("P2", 4)]).await.unwrap();
        assert_eq!(totals(&c, "P2").reserved, 4);

        // Retrying a partly-applied order must not undo the held line.
        let err = c
            .reserve_all(order, &[line("P2", 4), line("P1", 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::Rejected(_)));
        assert_eq!(totals(&c, "P2").reserved, 4);
    }

    #[tokio::test]
    async fn release_then_debit_follow_the_order_key() {
        let c = client();
        let order = OrderId::new();
        c.reserve_all(order, &[line("P2", 2), line("P2", 3)])
            .await
            .unwrap();
        assert_eq!(totals(&c, "P2").reserved, 5);

        c.debit_all(order, &[line("P2", 5)]).await.unwrap();
        c.debit_all(order, &[line("P2", 5)]).await.unwrap();
        assert_eq!(totals(&c, "P2"), StockTotals { available: 5, reserved: 0 });

        c.release_all(order, &[line("P2", 5)]).await.unwrap();
        assert_eq!(totals(&c, "P2"), StockTotals { available: 5, reserved: 0 });
    }

    #[test]
    fn unkeyed_release_beyond_reserved_is_a_diagnostic() {
        let c = client();
        let err = c
            .release_lines(None, &[(ProductId::from("P1"), 2)])
            .unwrap_err();
        let ReservationError::Rejected(diagnostics) = err else {
            panic!("expected rejection");
        };
        assert_eq!((diagnostics[0].requested, diagnostics[0].available), (2, 0));
    }
}
