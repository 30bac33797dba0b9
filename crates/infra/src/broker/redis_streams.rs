//! Redis Streams broker (durable, at-least-once).
//!
//! - **Stream key**: `pharmaflow:{topic}`, one stream per topic
//! - **Consumer group**: one per subscription name
//! - **Consumer**: `{subscription}-{uuid}`, unique per process
//! - **Dead letters**: `pharmaflow:{topic}:dlq`
//!
//! A nacked entry is simply left in the consumer's pending list; `receive`
//! reads that list (`XREADGROUP ... 0`) before asking for new entries (`>`),
//! so redelivery comes first and keeps stream order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::streams::StreamReadReply;
use tracing::{error, instrument, warn};

use pharmaflow_events::IntegrationEvent;

use super::{
    Broker, BrokerError, BrokerMessage, DEFAULT_MAX_DELIVERIES, MessagePublisher, MessageSource,
};

const STREAM_PREFIX: &str = "pharmaflow";

fn stream_key(topic: &str) -> String {
    format!("{STREAM_PREFIX}:{topic}")
}

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    max_deliveries: u32,
}

impl RedisStreamsBroker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        })
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

impl MessagePublisher for RedisStreamsBroker {
    #[instrument(skip(self, event), fields(event_type = %event.kind()), err)]
    fn publish(&self, topic: &str, event: &IntegrationEvent) -> Result<(), BrokerError> {
        let payload = event
            .encode()
            .map_err(|e| BrokerError::Encode(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(stream_key(topic))
            .arg("*")
            .arg("event_type")
            .arg(event.kind().as_str())
            .arg("payload")
            .arg(payload)
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }
}

impl Broker for RedisStreamsBroker {
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageSource>, BrokerError> {
        let key = stream_key(topic);
        let mut conn = self.connection()?;

        // "$": a fresh group starts at the end of the stream. Creating an
        // existing group fails with BUSYGROUP, which is fine.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&key)
            .arg(subscription)
            .arg("$")
            .arg("MKSTREAM")
            .query(&mut conn);
        if let Err(e) = created {
            if e.code() != Some("BUSYGROUP") {
                return Err(BrokerError::Command(format!("XGROUP CREATE failed: {e}")));
            }
        }

        Ok(Arc::new(RedisStreamsSource {
            client: self.client.clone(),
            label: format!("{topic}/{subscription}"),
            dlq_key: format!("{key}:dlq"),
            stream_key: key,
            group: subscription.to_string(),
            consumer: format!("{subscription}-{}", uuid::Uuid::now_v7()),
            max_deliveries: self.max_deliveries,
            conn: Mutex::new(Some(conn)),
            deliveries: Mutex::new(HashMap::new()),
        }))
    }
}

struct RedisStreamsSource {
    client: Arc<redis::Client>,
    label: String,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    max_deliveries: u32,
    conn: Mutex<Option<redis::Connection>>,
    /// message id -> (delivery count, payload) for entries handed out and not yet acked.
    deliveries: Mutex<HashMap<String, (u32, Vec<u8>)>>,
}

impl RedisStreamsSource {
    /// Run `f` on the cached connection, reconnecting once if none is held.
    ///
    /// A failed command drops the connection so the next call starts clean.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, BrokerError> {
        let mut slot = self
            .conn
            .lock()
            .map_err(|_| BrokerError::Command("connection lock poisoned".to_string()))?;
        if slot.is_none() {
            *slot = Some(
                self.client
                    .get_connection()
                    .map_err(|e| BrokerError::Connection(e.to_string()))?,
            );
        }
        let Some(conn) = slot.as_mut() else {
            return Err(BrokerError::Connection("no connection".to_string()));
        };
        match f(conn) {
            Ok(v) => Ok(v),
            Err(e) => {
                *slot = None;
                Err(BrokerError::Command(e.to_string()))
            }
        }
    }

    fn read(
        &self,
        from: &str,
        block: Option<Duration>,
    ) -> Result<Option<(String, Vec<u8>)>, BrokerError> {
        let reply: Option<StreamReadReply> = self.with_conn(|conn| {
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(1);
            if let Some(block) = block {
                cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
            }
            cmd.arg("STREAMS").arg(&self.stream_key).arg(from);
            cmd.query(conn)
        })?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();
        Ok(entry.map(|e| {
            let payload = e.get::<Vec<u8>>("payload").unwrap_or_default();
            (e.id, payload)
        }))
    }

    fn deliveries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (u32, Vec<u8>)>>, BrokerError> {
        self.deliveries
            .lock()
            .map_err(|_| BrokerError::Command("delivery table lock poisoned".to_string()))
    }
}

impl MessageSource for RedisStreamsSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn receive(&self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        // Own pending entries (previously nacked or never acked) first.
        let next = match self.read("0", None)? {
            Some(entry) => Some(entry),
            None => self.read(">", Some(timeout))?,
        };
        let Some((id, payload)) = next else {
            return Ok(None);
        };

        let mut deliveries = self.deliveries()?;
        let count = {
            let slot = deliveries.entry(id.clone()).or_insert((0, payload.clone()));
            slot.0 += 1;
            slot.0
        };
        Ok(Some(BrokerMessage {
            id,
            payload,
            delivery_count: count,
        }))
    }

    fn ack(&self, message_id: &str) -> Result<(), BrokerError> {
        let _: u64 = self.with_conn(|conn| {
            redis::cmd("XACK")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(message_id)
                .query(conn)
        })?;
        self.deliveries()?.remove(message_id);
        Ok(())
    }

    fn nack(&self, message_id: &str) -> Result<(), BrokerError> {
        let exhausted = {
            let deliveries = self.deliveries()?;
            deliveries
                .get(message_id)
                .filter(|(count, _)| *count >= self.max_deliveries)
                .cloned()
        };
        let Some((count, payload)) = exhausted else {
            // Stays in the pending list; the next receive hands it out again.
            return Ok(());
        };

        let _: String = self
            .with_conn(|conn| {
                redis::cmd("XADD")
                    .arg(&self.dlq_key)
                    .arg("*")
                    .arg("original_message_id")
                    .arg(message_id)
                    .arg("subscription")
                    .arg(&self.group)
                    .arg("delivery_count")
                    .arg(count)
                    .arg("failed_at")
                    .arg(chrono::Utc::now().to_rfc3339())
                    .arg("payload")
                    .arg(&payload)
                    .query(conn)
            })
            .map_err(|e| {
                error!(subscription = %self.label, message_id, error = %e, "dead-letter write failed");
                e
            })?;

        warn!(
            subscription = %self.label,
            message_id,
            delivery_count = count,
            "message dead-lettered"
        );
        self.ack(message_id)
    }
}
