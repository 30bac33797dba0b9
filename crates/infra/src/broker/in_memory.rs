use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use pharmaflow_events::IntegrationEvent;

use super::{
    Broker, BrokerError, BrokerMessage, DEFAULT_MAX_DELIVERIES, MessagePublisher, MessageSource,
};

/// A message that exhausted its deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub topic: String,
    pub subscription: String,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
}

#[derive(Debug, Clone)]
struct Pending {
    id: String,
    payload: Arc<[u8]>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    in_flight: HashMap<String, Pending>,
}

#[derive(Debug)]
struct Queue {
    topic: String,
    subscription: String,
    label: String,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Queue {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Command("queue lock poisoned".to_string()))
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// topic -> subscription -> queue
    topics: Mutex<HashMap<String, HashMap<String, Arc<Queue>>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    next_id: AtomicU64,
}

/// Process-local broker with per-subscription queues.
///
/// Cloning shares the same queues.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
    max_deliveries: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Publish pre-encoded bytes, bypassing [`IntegrationEvent::encode`].
    ///
    /// Lets other producers' payloads (and broken ones) into a topic.
    pub fn publish_raw(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let queues: Vec<Arc<Queue>> = {
            let topics = self
                .inner
                .topics
                .lock()
                .map_err(|_| BrokerError::Command("topic lock poisoned".to_string()))?;
            topics
                .get(topic)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default()
        };
        if queues.is_empty() {
            debug!(topic, "no subscriptions; message discarded");
            return Ok(());
        }

        let id = format!("{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let payload: Arc<[u8]> = Arc::from(payload);
        for queue in queues {
            let mut state = queue.lock()?;
            state.ready.push_back(Pending {
                id: id.clone(),
                payload: payload.clone(),
                delivery_count: 0,
            });
            drop(state);
            queue.available.notify_one();
        }
        Ok(())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Ready plus in-flight messages of one subscription.
    pub fn pending_count(&self, topic: &str, subscription: &str) -> usize {
        let queue = match self.inner.topics.lock() {
            Ok(topics) => topics.get(topic).and_then(|s| s.get(subscription)).cloned(),
            Err(_) => None,
        };
        queue
            .and_then(|q| q.lock().ok().map(|s| s.ready.len() + s.in_flight.len()))
            .unwrap_or(0)
    }
}

impl MessagePublisher for InMemoryBroker {
    fn publish(&self, topic: &str, event: &IntegrationEvent) -> Result<(), BrokerError> {
        let payload = event
            .encode()
            .map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.publish_raw(topic, &payload)
    }
}

impl Broker for InMemoryBroker {
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageSource>, BrokerError> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .map_err(|_| BrokerError::Command("topic lock poisoned".to_string()))?;
        let queue = topics
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_insert_with(|| {
                Arc::new(Queue {
                    topic: topic.to_string(),
                    subscription: subscription.to_string(),
                    label: format!("{topic}/{subscription}"),
                    state: Mutex::new(QueueState::default()),
                    available: Condvar::new(),
                })
            })
            .clone();

        Ok(Arc::new(InMemorySource {
            queue,
            inner: self.inner.clone(),
            max_deliveries: self.max_deliveries,
        }))
    }
}

struct InMemorySource {
    queue: Arc<Queue>,
    inner: Arc<Inner>,
    max_deliveries: u32,
}

impl MessageSource for InMemorySource {
    fn name(&self) -> &str {
        &self.queue.label
    }

    fn receive(&self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.queue.lock()?;
        loop {
            if let Some(mut next) = state.ready.pop_front() {
                next.delivery_count += 1;
                let message = BrokerMessage {
                    id: next.id.clone(),
                    payload: next.payload.to_vec(),
                    delivery_count: next.delivery_count,
                };
                state.in_flight.insert(next.id.clone(), next);
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .queue
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| BrokerError::Command("queue lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn ack(&self, message_id: &str) -> Result<(), BrokerError> {
        let mut state = self.queue.lock()?;
        if state.in_flight.remove(message_id).is_none() {
            debug!(subscription = %self.queue.label, message_id, "ack for unknown message");
        }
        Ok(())
    }

    fn nack(&self, message_id: &str) -> Result<(), BrokerError> {
        let mut state = self.queue.lock()?;
        let Some(pending) = state.in_flight.remove(message_id) else {
            debug!(subscription = %self.queue.label, message_id, "nack for unknown message");
            return Ok(());
        };

        if pending.delivery_count >= self.max_deliveries {
            drop(state);
            warn!(
                subscription = %self.queue.label,
                message_id,
                delivery_count = pending.delivery_count,
                "message dead-lettered"
            );
            let mut dead = self
                .inner
                .dead_letters
                .lock()
                .map_err(|_| BrokerError::Command("dead-letter lock poisoned".to_string()))?;
            dead.push(DeadLetter {
                topic: self.queue.topic.clone(),
                subscription: self.queue.subscription.clone(),
                message_id: pending.id,
                payload: pending.payload.to_vec(),
                delivery_count: pending.delivery_count,
            });
            return Ok(());
        }

        // Head of the queue: redelivered before anything newer.
        state.ready.push_front(pending);
        drop(state);
        self.queue.available.notify_one();
        Ok(())
    }
}
