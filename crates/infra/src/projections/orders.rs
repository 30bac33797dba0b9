use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use pharmaflow_core::{Aggregate, AggregateRoot, CustomerId, OrderId, SellerId};
use pharmaflow_events::{Event, EventEnvelope};
use pharmaflow_orders::{Order, OrderEvent, OrderLine, OrderStatus};

use crate::event_store::StoredEvent;
use crate::logistics::OrderStatusLookup;
use crate::read_model::ReadStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderReadModel {
    pub order_id: OrderId,
    pub customer_id: Option<CustomerId>,
    pub seller_id: Option<SellerId>,
    pub delivery_address: Option<String>,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub total: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters for [`OrdersProjection::list`]. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub seller_id: Option<SellerId>,
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Error)]
pub enum OrderProjectionError {
    #[error("failed to deserialize order event: {0}")]
    Deserialize(String),
    #[error("sequence number must start at 1")]
    ZeroSequence,
    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Orders read model, fed from the local event bus.
///
/// Each order is folded through the `Order` aggregate itself so the read side
/// can never disagree with the write side about status or totals. The
/// aggregate's version doubles as the per-stream cursor: envelopes at or below
/// it are redeliveries and are skipped.
#[derive(Debug)]
pub struct OrdersProjection<S>
where
    S: ReadStore<OrderId, OrderReadModel>,
{
    store: S,
    working: RwLock<HashMap<OrderId, Order>>,
}

impl<S> OrdersProjection<S>
where
    S: ReadStore<OrderId, OrderReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            working: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, order_id: &OrderId) -> Option<OrderReadModel> {
        self.store.get(order_id)
    }

    /// Matching orders, oldest first.
    pub fn list(&self, filter: &OrderFilter) -> Vec<OrderReadModel> {
        let mut orders: Vec<OrderReadModel> = self
            .store
            .list()
            .into_iter()
            .filter(|o| match &filter.seller_id {
                Some(seller) => o.seller_id.as_ref() == Some(seller),
                None => true,
            })
            .filter(|o| filter.status.is_none_or(|s| o.status == s))
            .collect();
        orders.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        orders
    }

    /// Apply one committed order event. Envelopes for other aggregate types
    /// are ignored.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), OrderProjectionError> {
        if envelope.aggregate_type() != Order::AGGREGATE_TYPE {
            return Ok(());
        }

        let seq = envelope.sequence_number();
        if seq == 0 {
            return Err(OrderProjectionError::ZeroSequence);
        }

        let order_id = OrderId::from(envelope.aggregate_id());
        let mut working = match self.working.write() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let order = working
            .entry(order_id)
            .or_insert_with(|| Order::empty(order_id));

        let last = order.version();
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(OrderProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: OrderEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| OrderProjectionError::Deserialize(e.to_string()))?;
        order.apply(&event);

        let at = event.occurred_at();
        let created_at = self
            .store
            .get(&order_id)
            .map(|existing| existing.created_at)
            .unwrap_or(at);
        self.store.upsert(
            order_id,
            OrderReadModel {
                order_id,
                customer_id: order.customer_id().cloned(),
                seller_id: order.seller_id().cloned(),
                delivery_address: order.delivery_address().map(str::to_string),
                status: order.status(),
                lines: order.lines().to_vec(),
                total: order.total(),
                version: order.version(),
                created_at,
                updated_at: at,
            },
        );
        Ok(())
    }

    /// Drop all state and replay `events` in order.
    pub fn rebuild_from_scratch(&self, events: &[StoredEvent]) -> Result<(), OrderProjectionError> {
        self.store.clear();
        match self.working.write() {
            Ok(mut w) => w.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        for stored in events {
            self.apply_envelope(&stored.to_envelope())?;
        }
        Ok(())
    }
}

impl<S> OrderStatusLookup for OrdersProjection<S>
where
    S: ReadStore<OrderId, OrderReadModel>,
{
    fn order_status(&self, order_id: &OrderId) -> Option<OrderStatus> {
        self.store.get(order_id).map(|o| o.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use pharmaflow_core::ProductId;
    use pharmaflow_events::{EventBus, InMemoryEventBus};
    use pharmaflow_orders::{AddLine, ConfirmOrder, CreateOrder, OrderCommand};

    use crate::command_dispatcher::CommandDispatcher;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::read_model::InMemoryReadStore;

    type Dispatcher =
        CommandDispatcher<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

    fn dispatcher() -> Dispatcher {
        CommandDispatcher::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
        )
    }

    fn run(d: &Dispatcher, order_id: OrderId, cmd: OrderCommand) -> Vec<StoredEvent> {
        d.dispatch(order_id.into(), Order::AGGREGATE_TYPE, cmd, |id| {
            Order::empty(id.into())
        })
        .unwrap()
    }

    fn seed(d: &Dispatcher, seller: &str) -> (OrderId, Vec<StoredEvent>) {
        let order_id = OrderId::new();
        let mut events = run(
            d,
            order_id,
            OrderCommand::CreateOrder(CreateOrder {
                order_id,
                customer_id: Some(CustomerId::parse("C1").unwrap()),
                seller_id: Some(SellerId::parse(seller).unwrap()),
                delivery_address: Some("1 Main St".into()),
                occurred_at: Utc::now(),
            }),
        );
        events.extend(run(
            d,
            order_id,
            OrderCommand::AddLine(AddLine {
                order_id,
                product_id: ProductId::parse("P1").unwrap(),
                product_name: "Paracetamol".into(),
                quantity: 3,
                unit_price: 250,
                occurred_at: Utc::now(),
            }),
        ));
        (order_id, events)
    }

    #[test]
    fn folds_events_into_a_read_model() {
        let d = dispatcher();
        let (order_id, events) = seed(&d, "S1");
        let projection = OrdersProjection::new(InMemoryReadStore::new());

        for e in &events {
            projection.apply_envelope(&e.to_envelope()).unwrap();
        }

        let model = projection.get(&order_id).unwrap();
        assert_eq!(model.status, OrderStatus::Draft);
        assert_eq!(model.total, 750);
        assert_eq!(model.version, 2);
        assert_eq!(model.lines.len(), 1);
        assert_eq!(projection.order_status(&order_id), Some(OrderStatus::Draft));
    }

    #[test]
    fn redelivered_envelopes_are_skipped() {
        let d = dispatcher();
        let (order_id, events) = seed(&d, "S1");
        let projection = OrdersProjection::new(InMemoryReadStore::new());

        for e in events.iter().chain(events.iter()) {
            projection.apply_envelope(&e.to_envelope()).unwrap();
        }

        let model = projection.get(&order_id).unwrap();
        assert_eq!(model.lines[0].quantity, 3);
        assert_eq!(model.version, 2);
    }

    #[test]
    fn gaps_are_rejected() {
        let d = dispatcher();
        let (_, events) = seed(&d, "S1");
        let projection = OrdersProjection::new(InMemoryReadStore::new());

        let err = projection.apply_envelope(&events[1].to_envelope()).unwrap_err();
        assert!(matches!(
            err,
            OrderProjectionError::NonMonotonicSequence { last: 0, found: 2 }
        ));
    }

    #[test]
    fn list_filters_by_seller_and_status() {
        let d = dispatcher();
        let (a, mut events) = seed(&d, "S1");
        let (_, b_events) = seed(&d, "S2");
        events.extend(b_events);
        events.extend(run(
            &d,
            a,
            OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id: a,
                occurred_at: Utc::now(),
            }),
        ));

        let projection = OrdersProjection::new(InMemoryReadStore::new());
        for e in &events {
            projection.apply_envelope(&e.to_envelope()).unwrap();
        }

        assert_eq!(projection.list(&OrderFilter::default()).len(), 2);
        let s1 = projection.list(&OrderFilter {
            seller_id: Some(SellerId::parse("S1").unwrap()),
            status: None,
        });
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].order_id, a);
        let confirmed = projection.list(&OrderFilter {
            seller_id: None,
            status: Some(OrderStatus::Confirmed),
        });
        assert_eq!(confirmed.len(), 1);
        let drafts_of_s1 = projection.list(&OrderFilter {
            seller_id: Some(SellerId::parse("S1").unwrap()),
            status: Some(OrderStatus::Draft),
        });
        assert!(drafts_of_s1.is_empty());
    }

    #[test]
    fn rebuild_replays_the_store() {
        let d = dispatcher();
        let (order_id, _) = seed(&d, "S1");
        let projection = OrdersProjection::new(InMemoryReadStore::new());

        let stream = d.store().load_stream(order_id.into()).unwrap();
        projection.rebuild_from_scratch(&stream).unwrap();
        projection.rebuild_from_scratch(&stream).unwrap();

        assert_eq!(projection.get(&order_id).unwrap().version, 2);
    }

    #[test]
    fn other_aggregate_types_are_ignored() {
        let projection = OrdersProjection::new(InMemoryReadStore::new());
        let bus = InMemoryEventBus::<EventEnvelope<JsonValue>>::new();
        let sub = bus.subscribe();
        let env = EventEnvelope::new(
            uuid::Uuid::now_v7(),
            OrderId::new().into(),
            "logistics.delivery".to_string(),
            1,
            "logistics.delivery.created".to_string(),
            serde_json::json!({}),
        );
        bus.publish(env).unwrap();

        projection.apply_envelope(&sub.recv().unwrap()).unwrap();
        assert!(projection.list(&OrderFilter::default()).is_empty());
    }
}
