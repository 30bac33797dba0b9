//! Local reactions to integration events.
//!
//! Every handler here may see the same event more than once and must leave
//! the system as if it had seen it once:
//! - deliveries are created with insert-if-absent and moved with idempotent
//!   transitions;
//! - stock movements carry the order's idempotency key;
//! - lots are received by lot id.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use pharmaflow_core::OrderId;
use pharmaflow_events::{EventHandler, HandlerError, IntegrationEvent, LineQuantity};
use pharmaflow_inventory::{IdempotencyKey, InventoryLot, LedgerError, LedgerOutcome};
use pharmaflow_logistics::Delivery;

use crate::fanout::{FanOut, FanOutFrame};
use crate::ledger::StockLedger;
use crate::read_model::ReadStore;
use crate::reservation::coalesce;

fn ledger_failure(err: LedgerError) -> HandlerError {
    match err {
        LedgerError::Poisoned => HandlerError::Transient(err.to_string()),
        other => HandlerError::Rejected(other.to_string()),
    }
}

fn apply_lines(
    lines: &[LineQuantity],
    mut op: impl FnMut(&pharmaflow_core::ProductId, u32) -> Result<LedgerOutcome, LedgerError>,
) -> Result<usize, HandlerError> {
    let mut applied = 0;
    for (product_id, quantity) in coalesce(lines) {
        if op(&product_id, quantity).map_err(ledger_failure)? == LedgerOutcome::Applied {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Logistics: one delivery per confirmed order.
pub struct CreateDeliveryOnOrderConfirmed<S> {
    deliveries: S,
}

impl<S> CreateDeliveryOnOrderConfirmed<S> {
    pub fn new(deliveries: S) -> Self {
        Self { deliveries }
    }
}

impl<S> EventHandler for CreateDeliveryOnOrderConfirmed<S>
where
    S: ReadStore<OrderId, Delivery>,
{
    fn name(&self) -> &'static str {
        "create_delivery_on_order_confirmed"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::OrderConfirmed(confirmed) = event else {
            return Ok(());
        };
        let delivery = Delivery::from_order_confirmed(confirmed, Utc::now());
        let delivery_id = delivery.delivery_id;
        if self.deliveries.insert_if_absent(confirmed.order_id, delivery) {
            info!(order_id = %confirmed.order_id, %delivery_id, "delivery scheduled");
        } else {
            debug!(order_id = %confirmed.order_id, "delivery already exists");
        }
        Ok(())
    }
}

/// Inventory: make sure a confirmed order's stock is held.
///
/// The confirmation workflow reserves synchronously with the same key, so
/// in the normal case every line comes back `AlreadyApplied`.
pub struct ReserveStockOnOrderConfirmed<L> {
    ledger: L,
}

impl<L> ReserveStockOnOrderConfirmed<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }
}

impl<L> EventHandler for ReserveStockOnOrderConfirmed<L>
where
    L: StockLedger,
{
    fn name(&self) -> &'static str {
        "reserve_stock_on_order_confirmed"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::OrderConfirmed(confirmed) = event else {
            return Ok(());
        };
        let key = IdempotencyKey::reserve(confirmed.order_id);
        let lines: Vec<LineQuantity> = confirmed
            .lines
            .iter()
            .map(|l| LineQuantity {
                product_id: l.product_id.clone(),
                quantity: l.quantity,
            })
            .collect();
        let applied = apply_lines(&lines, |p, q| self.ledger.reserve(p, q, Some(key)))?;
        if applied > 0 {
            warn!(
                order_id = %confirmed.order_id,
                lines = applied,
                "reservation was missing; reserved now"
            );
        }
        Ok(())
    }
}

/// Inventory: hand back the stock of a cancelled confirmed order.
pub struct ReleaseStockOnOrderCancelled<L> {
    ledger: L,
}

impl<L> ReleaseStockOnOrderCancelled<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }
}

impl<L> EventHandler for ReleaseStockOnOrderCancelled<L>
where
    L: StockLedger,
{
    fn name(&self) -> &'static str {
        "release_stock_on_order_cancelled"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::OrderCancelled(cancelled) = event else {
            return Ok(());
        };
        if !cancelled.was_confirmed {
            return Ok(());
        }
        let key = IdempotencyKey::cancel(cancelled.order_id);
        let released = apply_lines(&cancelled.lines, |p, q| self.ledger.release(p, q, Some(key)))?;
        info!(
            order_id = %cancelled.order_id,
            lines = released,
            "stock released for cancelled order"
        );
        Ok(())
    }
}

/// Inventory: delivered goods leave the ledger.
pub struct DebitStockOnOrderDelivered<L> {
    ledger: L,
}

impl<L> DebitStockOnOrderDelivered<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }
}

impl<L> EventHandler for DebitStockOnOrderDelivered<L>
where
    L: StockLedger,
{
    fn name(&self) -> &'static str {
        "debit_stock_on_order_delivered"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::OrderDelivered(delivered) = event else {
            return Ok(());
        };
        let key = IdempotencyKey::debit(delivered.order_id);
        apply_lines(&delivered.lines, |p, q| self.ledger.debit(p, q, Some(key)))?;
        Ok(())
    }
}

/// Inventory: a newly assigned lot becomes available.
pub struct ReceiveStockOnInventoryAssigned<L> {
    ledger: L,
}

impl<L> ReceiveStockOnInventoryAssigned<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }
}

impl<L> EventHandler for ReceiveStockOnInventoryAssigned<L>
where
    L: StockLedger,
{
    fn name(&self) -> &'static str {
        "receive_stock_on_inventory_assigned"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::InventoryAssigned(assigned) = event else {
            return Ok(());
        };
        self.ledger
            .receive_lot(InventoryLot::from_assigned(assigned))
            .map_err(ledger_failure)?;
        Ok(())
    }
}

/// Logistics: the delivery is done.
pub struct FinalizeDeliveryOnOrderDelivered<S> {
    deliveries: S,
}

impl<S> FinalizeDeliveryOnOrderDelivered<S> {
    pub fn new(deliveries: S) -> Self {
        Self { deliveries }
    }
}

impl<S> EventHandler for FinalizeDeliveryOnOrderDelivered<S>
where
    S: ReadStore<OrderId, Delivery>,
{
    fn name(&self) -> &'static str {
        "finalize_delivery_on_order_delivered"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::OrderDelivered(delivered) = event else {
            return Ok(());
        };
        let now = Utc::now();
        let outcome = self.deliveries.modify(&delivered.order_id, |d| {
            d.mark_delivered()?;
            d.refresh_snapshot("delivered", now);
            Ok::<_, pharmaflow_core::DomainError>(())
        });
        match outcome {
            Some(result) => result.map_err(|e| HandlerError::Rejected(e.to_string())),
            None => {
                warn!(order_id = %delivered.order_id, "no delivery for delivered order");
                Ok(())
            }
        }
    }
}

/// Logistics: a cancelled order does not ship.
pub struct CancelDeliveryOnOrderCancelled<S> {
    deliveries: S,
}

impl<S> CancelDeliveryOnOrderCancelled<S> {
    pub fn new(deliveries: S) -> Self {
        Self { deliveries }
    }
}

impl<S> EventHandler for CancelDeliveryOnOrderCancelled<S>
where
    S: ReadStore<OrderId, Delivery>,
{
    fn name(&self) -> &'static str {
        "cancel_delivery_on_order_cancelled"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::OrderCancelled(cancelled) = event else {
            return Ok(());
        };
        let now = Utc::now();
        let outcome = self.deliveries.modify(&cancelled.order_id, |d| {
            d.cancel()?;
            d.refresh_snapshot("cancelled", now);
            Ok::<_, pharmaflow_core::DomainError>(())
        });
        // Draft orders never had a delivery.
        outcome
            .unwrap_or(Ok(()))
            .map_err(|e| HandlerError::Rejected(e.to_string()))
    }
}

/// Real-time: rebroadcast stock movements to connected observers.
pub struct BroadcastInventoryChanged {
    fanout: Arc<FanOut>,
}

impl BroadcastInventoryChanged {
    pub fn new(fanout: Arc<FanOut>) -> Self {
        Self { fanout }
    }
}

impl EventHandler for BroadcastInventoryChanged {
    fn name(&self) -> &'static str {
        "broadcast_inventory_changed"
    }

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
        let IntegrationEvent::InventoryChanged(change) = event else {
            return Ok(());
        };
        let frame = FanOutFrame::inventory_changed(change)
            .map_err(|e| HandlerError::Rejected(e.to_string()))?;
        let report = self.fanout.notify(frame);
        debug!(
            product_id = %change.product_id,
            delivered = report.delivered,
            dropped = report.dropped,
            "inventory change broadcast"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;
    use pharmaflow_core::{CustomerId, LotId, ProductId};
    use pharmaflow_events::{
        ConfirmedLine, InventoryAssigned, OrderCancelled, OrderConfirmed, OrderDelivered,
    };
    use pharmaflow_inventory::StockTotals;
    use pharmaflow_logistics::DeliveryStatus;

    use crate::ledger::InMemoryLedger;
    use crate::read_model::InMemoryReadStore;

    fn ledger() -> Arc<InMemoryLedger> {
        let ledger = Arc::new(
            InMemoryLedger::new().with_today(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()),
        );
        ledger
            .receive_lot(InventoryLot::new(
                LotId::new(),
                ProductId::from("P1"),
                10,
                NaiveDate::from_ymd_opt(2030, 3, 1).unwrap(),
            ))
            .unwrap();
        ledger
    }

    fn totals(ledger: &InMemoryLedger) -> StockTotals {
        StockTotals::of(&ledger.get_availability(&ProductId::from("P1")).unwrap())
    }

    fn confirmed(order_id: OrderId, quantity: u32) -> IntegrationEvent {
        IntegrationEvent::OrderConfirmed(OrderConfirmed {
            order_id,
            seller_id: None,
            customer_id: CustomerId::from("C1"),
            delivery_address: Some("Rua A, 1".to_string()),
            lines: vec![ConfirmedLine {
                line_id: 1,
                product_id: ProductId::from("P1"),
                product_name: "Dipyrone".to_string(),
                quantity,
                unit_price: 300,
            }],
            total: 300 * u64::from(quantity),
            confirmed_at: Utc::now(),
        })
    }

    fn p1(quantity: u32) -> Vec<LineQuantity> {
        vec![LineQuantity {
            product_id: ProductId::from("P1"),
            quantity,
        }]
    }

    #[test]
    fn duplicate_confirmation_creates_one_delivery() {
        let store = Arc::new(InMemoryReadStore::<OrderId, Delivery>::new());
        let handler = CreateDeliveryOnOrderConfirmed::new(store.clone());
        let order_id = OrderId::new();
        let event = confirmed(order_id, 2);

        handler.handle(&event).unwrap();
        let first = store.get(&order_id).unwrap();
        handler.handle(&event).unwrap();

        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get(&order_id).unwrap().delivery_id, first.delivery_id);
    }

    #[test]
    fn reserve_handler_is_a_no_op_after_synchronous_reservation() {
        let ledger = ledger();
        let order_id = OrderId::new();
        ledger
            .reserve(&ProductId::from("P1"), 4, Some(IdempotencyKey::reserve(order_id)))
            .unwrap();

        let handler = ReserveStockOnOrderConfirmed::new(ledger.clone());
        handler.handle(&confirmed(order_id, 4)).unwrap();
        handler.handle(&confirmed(order_id, 4)).unwrap();

        assert_eq!(totals(&ledger), StockTotals { available: 6, reserved: 4 });
    }

    #[test]
    fn reserve_handler_rejects_when_stock_is_short() {
        let handler = ReserveStockOnOrderConfirmed::new(ledger());
        let err = handler.handle(&confirmed(OrderId::new(), 50)).unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
    }

    #[test]
    fn delivered_order_debits_once_and_finalizes_delivery() {
        let ledger = ledger();
        let store = Arc::new(InMemoryReadStore::<OrderId, Delivery>::new());
        let order_id = OrderId::new();
        ReserveStockOnOrderConfirmed::new(ledger.clone())
            .handle(&confirmed(order_id, 3))
            .unwrap();
        CreateDeliveryOnOrderConfirmed::new(store.clone())
            .handle(&confirmed(order_id, 3))
            .unwrap();

        let delivered = IntegrationEvent::OrderDelivered(OrderDelivered {
            order_id,
            lines: p1(3),
            delivered_at: Utc::now(),
        });
        let debit = DebitStockOnOrderDelivered::new(ledger.clone());
        let finalize = FinalizeDeliveryOnOrderDelivered::new(store.clone());
        for _ in 0..2 {
            debit.handle(&delivered).unwrap();
            finalize.handle(&delivered).unwrap();
        }

        assert_eq!(totals(&ledger), StockTotals { available: 7, reserved: 0 });
        let delivery = store.get(&order_id).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert_eq!(delivery.order_status, "delivered");
    }

    #[test]
    fn cancelling_a_confirmed_order_releases_and_cancels() {
        let ledger = ledger();
        let store = Arc::new(InMemoryReadStore::<OrderId, Delivery>::new());
        let order_id = OrderId::new();
        ReserveStockOnOrderConfirmed::new(ledger.clone())
            .handle(&confirmed(order_id, 3))
            .unwrap();
        CreateDeliveryOnOrderConfirmed::new(store.clone())
            .handle(&confirmed(order_id, 3))
            .unwrap();

        let cancelled = IntegrationEvent::OrderCancelled(OrderCancelled {
            order_id,
            was_confirmed: true,
            lines: p1(3),
            cancelled_at: Utc::now(),
        });
        let release = ReleaseStockOnOrderCancelled::new(ledger.clone());
        let cancel = CancelDeliveryOnOrderCancelled::new(store.clone());
        for _ in 0..2 {
            release.handle(&cancelled).unwrap();
            cancel.handle(&cancelled).unwrap();
        }

        assert_eq!(totals(&ledger), StockTotals { available: 10, reserved: 0 });
        assert_eq!(store.get(&order_id).unwrap().status, DeliveryStatus::Cancelled);
    }

    #[test]
    fn redelivered_confirmation_after_delivery_reserves_nothing() {
        let ledger = ledger();
        let order_id = OrderId::new();
        let reserve = ReserveStockOnOrderConfirmed::new(ledger.clone());
        reserve.handle(&confirmed(order_id, 3)).unwrap();
        DebitStockOnOrderDelivered::new(ledger.clone())
            .handle(&IntegrationEvent::OrderDelivered(OrderDelivered {
                order_id,
                lines: p1(3),
                delivered_at: Utc::now(),
            }))
            .unwrap();

        reserve.handle(&confirmed(order_id, 3)).unwrap();

        assert_eq!(totals(&ledger), StockTotals { available: 7, reserved: 0 });
    }

    #[test]
    fn redelivered_confirmation_after_cancellation_reserves_nothing() {
        let ledger = ledger();
        let order_id = OrderId::new();
        let reserve = ReserveStockOnOrderConfirmed::new(ledger.clone());
        reserve.handle(&confirmed(order_id, 3)).unwrap();
        ReleaseStockOnOrderCancelled::new(ledger.clone())
            .handle(&IntegrationEvent::OrderCancelled(OrderCancelled {
                order_id,
                was_confirmed: true,
                lines: p1(3),
                cancelled_at: Utc::now(),
            }))
            .unwrap();

        reserve.handle(&confirmed(order_id, 3)).unwrap();

        assert_eq!(totals(&ledger), StockTotals { available: 10, reserved: 0 });
    }

    #[test]
    fn cancelling_a_draft_touches_nothing() {
        let ledger = ledger();
        let store = Arc::new(InMemoryReadStore::<OrderId, Delivery>::new());
        let cancelled = IntegrationEvent::OrderCancelled(OrderCancelled {
            order_id: OrderId::new(),
            was_confirmed: false,
            lines: p1(3),
            cancelled_at: Utc::now(),
        });

        ReleaseStockOnOrderCancelled::new(ledger.clone())
            .handle(&cancelled)
            .unwrap();
        CancelDeliveryOnOrderCancelled::new(store.clone())
            .handle(&cancelled)
            .unwrap();

        assert_eq!(totals(&ledger), StockTotals { available: 10, reserved: 0 });
        assert!(store.list().is_empty());
    }

    #[test]
    fn assigned_lot_is_received_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let handler = ReceiveStockOnInventoryAssigned::new(ledger.clone());
        let event = IntegrationEvent::InventoryAssigned(InventoryAssigned {
            lot_id: LotId::new(),
            product_id: ProductId::from("P9"),
            warehouse_id: None,
            aisle: Some("A3".to_string()),
            shelf: None,
            quantity: 12,
            expiration_date: NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
            requires_cold_chain: true,
            assigned_at: Utc::now(),
        });

        handler.handle(&event).unwrap();
        handler.handle(&event).unwrap();

        let lots = ledger.get_availability(&ProductId::from("P9")).unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].quantity_available, 12);
        assert!(lots[0].requires_cold_chain);
    }

    #[test]
    fn inventory_changes_reach_observers() {
        let fanout = Arc::new(FanOut::default());
        let mut observer = fanout.register();
        let handler = BroadcastInventoryChanged::new(fanout.clone());

        handler
            .handle(&IntegrationEvent::InventoryChanged(
                pharmaflow_events::InventoryChanged {
                    product_id: ProductId::from("P1"),
                    change: pharmaflow_events::StockChangeKind::Debited,
                    quantity: 3,
                    total_available: 7,
                    total_reserved: 0,
                    occurred_at: Utc::now(),
                },
            ))
            .unwrap();

        let frame = observer.try_next().unwrap();
        assert_eq!(frame.event, "inventory_changed");
        assert_eq!(frame.data["totalAvailable"], 7);
    }
}
