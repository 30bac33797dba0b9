//! Forwards committed order events to the broker's `orders` topic.
//!
//! Runs as a [`ProjectionWorker`](crate::workers::ProjectionWorker) on the
//! local event bus. Only events with an integration counterpart leave the
//! process; line edits stay local.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument};

use pharmaflow_events::EventEnvelope;
use pharmaflow_orders::{Order, OrderEvent};

use crate::broker::{BrokerError, MessagePublisher, ORDERS_TOPIC};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("stored order event could not be decoded: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Publish(#[from] BrokerError),
}

#[derive(Debug)]
pub struct OrderEventRelay<P> {
    publisher: P,
}

impl<P> OrderEventRelay<P>
where
    P: MessagePublisher,
{
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    /// Returns whether anything was published.
    #[instrument(skip(self, envelope), fields(event_type = %envelope.event_type()))]
    pub fn forward(&self, envelope: &EventEnvelope<JsonValue>) -> Result<bool, RelayError> {
        if envelope.aggregate_type() != Order::AGGREGATE_TYPE {
            return Ok(false);
        }
        let event: OrderEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| RelayError::Deserialize(e.to_string()))?;
        let Some(integration) = event.to_integration() else {
            return Ok(false);
        };

        self.publisher.publish(ORDERS_TOPIC, &integration)?;
        debug!(
            aggregate_id = %envelope.aggregate_id(),
            sequence_number = envelope.sequence_number(),
            "order event relayed"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use pharmaflow_core::{CustomerId, OrderId, ProductId};
    use pharmaflow_events::{Decoded, EventBus, InMemoryEventBus, IntegrationEvent};
    use pharmaflow_orders::{AddLine, ConfirmOrder, CreateOrder, OrderCommand};

    use crate::broker::{Broker, InMemoryBroker};
    use crate::command_dispatcher::CommandDispatcher;
    use crate::event_store::InMemoryEventStore;

    #[test]
    fn only_lifecycle_events_reach_the_orders_topic() {
        let broker = InMemoryBroker::new();
        let source = broker.subscribe(ORDERS_TOPIC, "test").unwrap();
        let relay = OrderEventRelay::new(broker.clone());

        let bus = Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new());
        let sub = bus.subscribe();
        let dispatcher = CommandDispatcher::new(Arc::new(InMemoryEventStore::new()), bus);
        let order_id = OrderId::new();
        let now = Utc::now();
        for cmd in [
            OrderCommand::CreateOrder(CreateOrder {
                order_id,
                customer_id: Some(CustomerId::from("C1")),
                seller_id: None,
                delivery_address: None,
                occurred_at: now,
            }),
            OrderCommand::AddLine(AddLine {
                order_id,
                product_id: ProductId::from("P1"),
                product_name: "Amoxicillin".into(),
                quantity: 1,
                unit_price: 900,
                occurred_at: now,
            }),
            OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                occurred_at: now,
            }),
        ] {
            dispatcher
                .dispatch(order_id.into(), Order::AGGREGATE_TYPE, cmd, |id| {
                    Order::empty(id.into())
                })
                .unwrap();
        }

        let mut forwarded = Vec::new();
        while let Ok(envelope) = sub.try_recv() {
            forwarded.push(relay.forward(&envelope).unwrap());
        }
        assert_eq!(forwarded, vec![false, false, true]);

        let message = source.receive(Duration::from_millis(50)).unwrap().unwrap();
        match IntegrationEvent::decode(&message.payload).unwrap() {
            Decoded::Known(IntegrationEvent::OrderConfirmed(e)) => {
                assert_eq!(e.order_id, order_id);
                assert_eq!(e.total, 900);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(source.receive(Duration::from_millis(10)).unwrap().is_none());
    }
}
