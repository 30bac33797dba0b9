use std::collections::HashMap;
use std::sync::RwLock;

use pharmaflow_core::{AggregateId, ExpectedVersion};

use super::{EventStore, EventStoreError, PendingEvent, StoredEvent};

#[derive(Debug)]
struct Stream {
    aggregate_type: String,
    events: Vec<StoredEvent>,
}

/// Process-local event store. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Stream>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event of `aggregate_type`, stream by stream, for projection
    /// rebuilds.
    pub fn events_of_type(&self, aggregate_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        let mut ids: Vec<&AggregateId> = streams
            .iter()
            .filter(|(_, s)| s.aggregate_type == aggregate_type)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .flat_map(|id| streams[id].events.iter().cloned())
            .collect())
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Unavailable("event store lock poisoned".to_string())
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream_id: AggregateId,
        aggregate_type: &str,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        let stream = streams.entry(stream_id).or_insert_with(|| Stream {
            aggregate_type: aggregate_type.to_string(),
            events: Vec::new(),
        });

        if stream.aggregate_type != aggregate_type {
            return Err(EventStoreError::WrongAggregateType {
                stream: stream_id,
                existing: stream.aggregate_type.clone(),
                attempted: aggregate_type.to_string(),
            });
        }
        let actual = stream.events.len() as u64;
        if !expected.matches(actual) {
            return Err(EventStoreError::VersionConflict {
                stream: stream_id,
                expected,
                actual,
            });
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(actual + 1..)
            .map(|(e, sequence_number)| StoredEvent {
                event_id: e.event_id,
                aggregate_id: stream_id,
                aggregate_type: aggregate_type.to_string(),
                sequence_number,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            })
            .collect();
        stream.events.extend(committed.iter().cloned());
        Ok(committed)
    }

    fn load_stream(&self, stream_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(streams
            .get(&stream_id)
            .map(|s| s.events.clone())
            .unwrap_or_default())
    }
}
