//! Append-only order event streams.
//!
//! One stream per aggregate instance. Positions start at 1, are assigned on
//! append and never change; the orders projection and the broker relay rely
//! on them to skip redelivered envelopes.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use pharmaflow_core::{AggregateId, ExpectedVersion};
use pharmaflow_events::{Event, EventEnvelope};

pub use memory::InMemoryEventStore;

/// An encoded event waiting for a stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl PendingEvent {
    pub fn encode<E>(event: &E) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload =
            serde_json::to_value(event).map_err(|e| EventStoreError::Encode(e.to_string()))?;
        Ok(Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.payload.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("stream {stream} is at version {actual}, expected {expected:?}")]
    VersionConflict {
        stream: AggregateId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("stream {stream} holds `{existing}` events, refusing `{attempted}`")]
    WrongAggregateType {
        stream: AggregateId,
        existing: String,
        attempted: String,
    },
    #[error("event payload could not be encoded: {0}")]
    Encode(String),
    #[error("stream {stream} is corrupt: {reason}")]
    Corrupt { stream: AggregateId, reason: String },
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for aggregate streams.
///
/// `append` is all-or-nothing: either every event of the batch gets the next
/// consecutive positions or nothing is written.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        stream: AggregateId,
        aggregate_type: &str,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// The whole stream in position order; empty for an unknown aggregate.
    fn load_stream(&self, stream: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for std::sync::Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        stream: AggregateId,
        aggregate_type: &str,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(stream, aggregate_type, expected, events)
    }

    fn load_stream(&self, stream: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(stream)
    }
}
