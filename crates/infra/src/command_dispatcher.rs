//! Runs order commands against their event stream.
//!
//! ```text
//! load stream -> fold into aggregate -> handle(command) -> append(Exact(v)) -> publish
//! ```
//!
//! Envelopes go to the local bus only after the append succeeded. A failed
//! publish leaves the events stored and surfaces as `DispatchError::Publish`;
//! bus consumers skip positions they have already seen.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use pharmaflow_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use pharmaflow_events::{Event, EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, PendingEvent, StoredEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Another writer moved the stream first, or the command duplicates a
    /// creation. Reload and retry.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("not found")]
    NotFound,
    #[error("stored event could not be decoded: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Store(EventStoreError),
    #[error("publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::VersionConflict { .. } => DispatchError::Concurrency(err.to_string()),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                DispatchError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
        }
    }
}

#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Returns the committed events; empty when the command decided nothing.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        let aggregate = rehydrate(aggregate_id, &history, make_aggregate)?;
        let version = history.last().map_or(0, |e| e.sequence_number);

        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            return Ok(Vec::new());
        }

        let pending = decided
            .iter()
            .map(PendingEvent::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let committed = self.store.append(
            aggregate_id,
            aggregate_type,
            ExpectedVersion::Exact(version),
            pending,
        )?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }
        debug!(
            %aggregate_id,
            aggregate_type,
            committed = committed.len(),
            "command dispatched"
        );
        Ok(committed)
    }

    /// Current state without running a command; `None` for an empty stream.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Option<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        if history.is_empty() {
            return Ok(None);
        }
        rehydrate(aggregate_id, &history, make_aggregate).map(Some)
    }
}

/// Fold a loaded stream into a fresh aggregate, refusing streams that do not
/// belong to `aggregate_id` or whose positions are not 1, 2, 3, ...
fn rehydrate<A>(
    aggregate_id: AggregateId,
    history: &[StoredEvent],
    make_aggregate: impl FnOnce(AggregateId) -> A,
) -> Result<A, DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    let mut aggregate = make_aggregate(aggregate_id);
    for (expected, stored) in (1u64..).zip(history) {
        if stored.aggregate_id != aggregate_id || stored.sequence_number != expected {
            return Err(DispatchError::Store(EventStoreError::Corrupt {
                stream: aggregate_id,
                reason: format!(
                    "event {} at position {} where {expected} was expected",
                    stored.event_id, stored.sequence_number
                ),
            }));
        }
        let event: A::Event = stored
            .decode()
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&event);
    }
    Ok(aggregate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use pharmaflow_core::{AggregateRoot, CustomerId, OrderId, ProductId};
    use pharmaflow_events::InMemoryEventBus;
    use pharmaflow_orders::{
        AddLine, CreateOrder, MarkDelivered, Order, OrderCommand, OrderStatus,
    };

    use crate::event_store::InMemoryEventStore;

    type Dispatcher =
        CommandDispatcher<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

    fn dispatcher() -> Dispatcher {
        CommandDispatcher::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
        )
    }

    fn make(id: AggregateId) -> Order {
        Order::empty(id.into())
    }

    fn create(order_id: OrderId) -> OrderCommand {
        OrderCommand::CreateOrder(CreateOrder {
            order_id,
            customer_id: Some(CustomerId::from("C1")),
            seller_id: None,
            delivery_address: None,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn commits_then_publishes_in_order() {
        let d = dispatcher();
        let sub = d.bus.subscribe();
        let order_id = OrderId::new();

        d.dispatch(order_id.into(), Order::AGGREGATE_TYPE, create(order_id), make)
            .unwrap();
        let committed = d
            .dispatch(
                order_id.into(),
                Order::AGGREGATE_TYPE,
                OrderCommand::AddLine(AddLine {
                    order_id,
                    product_id: ProductId::from("P1"),
                    product_name: "Paracetamol".into(),
                    quantity: 2,
                    unit_price: 300,
                    occurred_at: Utc::now(),
                }),
                make,
            )
            .unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence_number, 2);
        assert_eq!(sub.try_recv().unwrap().sequence_number(), 1);
        assert_eq!(sub.try_recv().unwrap().sequence_number(), 2);

        let loaded = d.load(order_id.into(), make).unwrap().unwrap();
        assert_eq!(loaded.status(), OrderStatus::Draft);
        assert_eq!(loaded.total(), 600);
        assert_eq!(loaded.version(), 2);
    }

    #[test]
    fn rejected_commands_append_nothing() {
        let d = dispatcher();
        let order_id = OrderId::new();
        d.dispatch(order_id.into(), Order::AGGREGATE_TYPE, create(order_id), make)
            .unwrap();

        let duplicate = d
            .dispatch(order_id.into(), Order::AGGREGATE_TYPE, create(order_id), make)
            .unwrap_err();
        assert!(matches!(duplicate, DispatchError::Concurrency(_)));

        let skipped_step = d
            .dispatch(
                order_id.into(),
                Order::AGGREGATE_TYPE,
                OrderCommand::MarkDelivered(MarkDelivered {
                    order_id,
                    occurred_at: Utc::now(),
                }),
                make,
            )
            .unwrap_err();
        assert!(matches!(skipped_step, DispatchError::InvariantViolation(_)));

        assert_eq!(d.store.load_stream(order_id.into()).unwrap().len(), 1);
    }

    #[test]
    fn unknown_stream_loads_as_none() {
        let d = dispatcher();
        assert!(d.load(AggregateId::new(), make).unwrap().is_none());
    }
}
