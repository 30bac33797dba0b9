//! Real-time fan-out of inventory changes to connected observers.
//!
//! Each observer owns a bounded queue. `notify` never waits: a frame that
//! does not fit in an observer's queue is dropped for that observer only and
//! counted. Observers whose receiving side is gone are pruned on the next
//! `notify`.
//!
//! The registry is an ordinary value; the service builds one and hands an
//! `Arc<FanOut>` to whoever needs it.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use pharmaflow_events::InventoryChanged;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutConfig {
    pub capacity: usize,
    pub poll: Duration,
    pub heartbeat: Duration,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            poll: Duration::from_secs(1),
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// One server-sent event: a name and a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutFrame {
    pub event: String,
    pub data: JsonValue,
}

impl FanOutFrame {
    pub fn new(event: impl Into<String>, data: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn inventory_changed(change: &InventoryChanged) -> Result<Self, serde_json::Error> {
        Self::new("inventory_changed", change)
    }

    pub fn heartbeat() -> Self {
        Self {
            event: "heartbeat".to_string(),
            data: serde_json::json!({ "ts": Utc::now().to_rfc3339() }),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event == "heartbeat"
    }

    pub fn data_string(&self) -> String {
        self.data.to_string()
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// Per-call outcome of [`FanOut::notify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct Observer {
    tx: mpsc::Sender<FanOutFrame>,
    dropped: AtomicU64,
}

pub struct FanOut {
    config: FanOutConfig,
    observers: RwLock<HashMap<ConnectionId, Observer>>,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

impl core::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FanOut")
            .field("config", &self.config)
            .field("observers", &self.observer_count())
            .field("dropped_total", &self.dropped_total())
            .finish()
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(FanOutConfig::default())
    }
}

impl FanOut {
    pub fn new(config: FanOutConfig) -> Self {
        Self {
            config: FanOutConfig {
                capacity: config.capacity.max(1),
                ..config
            },
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> FanOutConfig {
        self.config
    }

    pub fn register(&self) -> ObserverStream {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.capacity);
        let observer = Observer {
            tx,
            dropped: AtomicU64::new(0),
        };
        match self.observers.write() {
            Ok(mut map) => {
                map.insert(id, observer);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, observer);
            }
        }
        debug!(connection = %id, "observer registered");
        ObserverStream {
            id,
            rx,
            poll: self.config.poll,
            heartbeat: self.config.heartbeat,
            last_heartbeat: Instant::now(),
        }
    }

    /// Returns whether the observer was still registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = match self.observers.write() {
            Ok(mut map) => map.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        };
        if removed {
            debug!(connection = %id, "observer unregistered");
        }
        removed
    }

    /// Offer `frame` to every observer without blocking.
    pub fn notify(&self, frame: FanOutFrame) -> NotifyReport {
        let mut report = NotifyReport::default();
        let mut closed = Vec::new();
        {
            let map = match self.observers.read() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (id, observer) in map.iter() {
                match observer.tx.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        report.dropped += 1;
                        observer.dropped.fetch_add(1, Ordering::Relaxed);
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            connection = %id,
                            event = %frame.event,
                            "observer queue full; frame dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        for id in closed {
            self.unregister(id);
        }
        report
    }

    pub fn observer_count(&self) -> usize {
        match self.observers.read() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Frames waiting in the observer's queue.
    pub fn queue_len(&self, id: ConnectionId) -> Option<usize> {
        let map = match self.observers.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&id).map(|o| o.tx.max_capacity() - o.tx.capacity())
    }

    pub fn dropped(&self, id: ConnectionId) -> Option<u64> {
        let map = match self.observers.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&id).map(|o| o.dropped.load(Ordering::Relaxed))
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

/// Receiving side of one observer.
#[derive(Debug)]
pub struct ObserverStream {
    id: ConnectionId,
    rx: mpsc::Receiver<FanOutFrame>,
    poll: Duration,
    heartbeat: Duration,
    last_heartbeat: Instant,
}

impl ObserverStream {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next frame for this observer.
    ///
    /// Waits on the queue in `poll` slices and yields a heartbeat frame once
    /// per `heartbeat` interval. `None` once the observer is unregistered and
    /// its queue drained.
    pub async fn next_frame(&mut self) -> Option<FanOutFrame> {
        loop {
            if self.last_heartbeat.elapsed() >= self.heartbeat {
                self.last_heartbeat = Instant::now();
                return Some(FanOutFrame::heartbeat());
            }
            match timeout(self.poll, self.rx.recv()).await {
                Ok(frame) => return frame,
                Err(_) => continue,
            }
        }
    }

    /// Non-blocking take, for tests and draining.
    pub fn try_next(&mut self) -> Option<FanOutFrame> {
        self.rx.try_recv().ok()
    }
}
