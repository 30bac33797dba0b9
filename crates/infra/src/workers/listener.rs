//! Supervised broker listeners.
//!
//! One OS thread per subscription. Messages of a subscription are handled
//! strictly one after another:
//!
//! ```text
//! receive ─► decode ─┬─ Known ──► dispatch ─┬─ ok ──────► ack
//!                    │                      └─ failure ─► nack, back off
//!                    ├─ Unknown ─► log ─► ack
//!                    └─ Malformed ► log ─► ack
//! ```
//!
//! A panicking handler counts as a failure: the message is nacked and comes
//! back. A broker error, or a panic outside a handler, ends the receive loop;
//! the supervisor logs it, backs off and starts the loop again until shutdown.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use pharmaflow_events::{Decoded, EventDispatcher, IntegrationEvent};

use super::retry::RetryPolicy;
use crate::broker::{BrokerError, BrokerMessage, MessageSource};

/// Counters kept per listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    /// Unknown or undecodable messages acked without dispatch.
    pub dropped: AtomicU64,
    pub restarts: AtomicU64,
}

impl ListenerStats {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn nacked(&self) -> u64 {
        self.nacked.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ListenerHandle {
    name: String,
    stats: Arc<ListenerStats>,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Stop after the message in hand (if any) and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Knobs shared by every listener of a supervisor.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How long one `receive` may block before the loop checks for shutdown.
    pub poll: Duration,
    pub retry: RetryPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

/// Owns the listener threads of a process.
#[derive(Debug, Default)]
pub struct ListenerSupervisor {
    config: ListenerConfig,
    handles: Vec<ListenerHandle>,
}

impl ListenerSupervisor {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            handles: Vec::new(),
        }
    }

    /// Start a listener on `source`, dispatching through `dispatcher`.
    pub fn spawn(
        &mut self,
        source: Arc<dyn MessageSource>,
        dispatcher: Arc<EventDispatcher>,
    ) -> std::io::Result<&ListenerHandle> {
        let name = source.name().to_string();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(ListenerStats::default());

        let listener = Listener {
            name: name.clone(),
            source,
            dispatcher,
            config: self.config.clone(),
            stats: stats.clone(),
            shutdown: shutdown_rx,
        };
        let join = thread::Builder::new()
            .name(format!("listener:{name}"))
            .spawn(move || listener.supervise())?;

        info!(listener = %name, "listener started");
        self.handles.push(ListenerHandle {
            name,
            stats,
            shutdown: shutdown_tx,
            join: Some(join),
        });
        let idx = self.handles.len() - 1;
        Ok(&self.handles[idx])
    }

    pub fn handles(&self) -> &[ListenerHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown();
        }
    }
}

enum Verdict {
    Ack,
    Nack,
}

/// Why the receive loop ended.
enum Exit {
    Shutdown,
    Broker(BrokerError),
}

struct Listener {
    name: String,
    source: Arc<dyn MessageSource>,
    dispatcher: Arc<EventDispatcher>,
    config: ListenerConfig,
    stats: Arc<ListenerStats>,
    shutdown: mpsc::Receiver<()>,
}

impl Listener {
    fn supervise(self) {
        let mut attempt = 0usize;
        loop {
            let run = catch_unwind(AssertUnwindSafe(|| self.run(&mut attempt)));
            let reason = match run {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Broker(err)) => err.to_string(),
                Err(_) => "listener panicked".to_string(),
            };

            self.stats.restarts.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.retry.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            error!(
                listener = %self.name,
                error = %reason,
                delay_ms = delay.as_millis() as u64,
                "listener stopped; restarting"
            );
            if self.sleep(delay) {
                break;
            }
        }
        info!(listener = %self.name, "listener stopped");
    }

    /// The receive loop. `attempt` counts consecutive failures and is reset
    /// by every successfully handled message.
    fn run(&self, attempt: &mut usize) -> Exit {
        loop {
            if self.shutdown_requested() {
                return Exit::Shutdown;
            }

            let message = match self.source.receive(self.config.poll) {
                Ok(Some(m)) => m,
                Ok(None) => continue,
                Err(err) => return Exit::Broker(err),
            };

            let verdict = catch_unwind(AssertUnwindSafe(|| self.handle(&message)))
                .unwrap_or_else(|_| {
                    error!(
                        listener = %self.name,
                        message_id = %message.id,
                        delivery_count = message.delivery_count,
                        "handler panicked; message nacked"
                    );
                    Verdict::Nack
                });
            let result = match verdict {
                Verdict::Ack => self.source.ack(&message.id).map(|()| {
                    self.stats.acked.fetch_add(1, Ordering::Relaxed);
                    *attempt = 0;
                }),
                Verdict::Nack => self.source.nack(&message.id).map(|()| {
                    self.stats.nacked.fetch_add(1, Ordering::Relaxed);
                    *attempt = attempt.saturating_add(1);
                }),
            };
            if let Err(err) = result {
                return Exit::Broker(err);
            }

            if *attempt > 0 {
                let delay = self.config.retry.delay_for_attempt(*attempt - 1);
                debug!(
                    listener = %self.name,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before redelivery"
                );
                if self.sleep(delay) {
                    return Exit::Shutdown;
                }
            }
        }
    }

    fn handle(&self, message: &BrokerMessage) -> Verdict {
        let event = match IntegrationEvent::decode(&message.payload) {
            Ok(Decoded::Known(event)) => event,
            Ok(Decoded::Unknown { event_type }) => {
                warn!(
                    listener = %self.name,
                    message_id = %message.id,
                    event_type = %event_type,
                    "unknown event type; dropped"
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Verdict::Ack;
            }
            Err(err) => {
                error!(
                    listener = %self.name,
                    message_id = %message.id,
                    error = %err,
                    "undecodable message; dropped"
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Verdict::Ack;
            }
        };

        match self.dispatcher.dispatch(&event) {
            Ok(handled) => {
                debug!(
                    listener = %self.name,
                    message_id = %message.id,
                    kind = %event.kind(),
                    handled,
                    "message handled"
                );
                Verdict::Ack
            }
            Err(failure) => {
                warn!(
                    listener = %self.name,
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    error = %failure,
                    "handler failed; message nacked"
                );
                Verdict::Nack
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        !matches!(self.shutdown.try_recv(), Err(mpsc::TryRecvError::Empty))
    }

    /// Interruptible sleep. Returns `true` when shutdown was requested.
    fn sleep(&self, delay: Duration) -> bool {
        !matches!(
            self.shutdown.recv_timeout(delay),
            Err(mpsc::RecvTimeoutError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    use chrono::Utc;
    use pharmaflow_core::ProductId;
    use pharmaflow_events::{
        EventHandler, EventKind, HandlerError, InventoryChanged, StockChangeKind,
    };

    use crate::broker::{Broker, InMemoryBroker, MessagePublisher};

    fn changed(quantity: u32) -> IntegrationEvent {
        IntegrationEvent::InventoryChanged(InventoryChanged {
            product_id: ProductId::from("P1"),
            change: StockChangeKind::Received,
            quantity,
            total_available: u64::from(quantity),
            total_reserved: 0,
            occurred_at: Utc::now(),
        })
    }

    /// Records quantities; fails the first `fail_first` calls.
    struct Recorder {
        seen: Mutex<Vec<u32>>,
        fail_first: Mutex<u32>,
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HandlerError::Transient("not yet".into()));
            }
            if let IntegrationEvent::InventoryChanged(c) = event {
                self.seen.lock().unwrap().push(c.quantity);
            }
            Ok(())
        }
    }

    fn fast() -> ListenerConfig {
        ListenerConfig {
            poll: Duration::from_millis(20),
            retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn setup(fail_first: u32) -> (InMemoryBroker, Arc<Recorder>, ListenerSupervisor) {
        let broker = InMemoryBroker::with_max_deliveries(10);
        let source = broker.subscribe("inventory", "test").unwrap();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_first: Mutex::new(fail_first),
        });
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(EventKind::InventoryChanged, recorder.clone());

        let mut supervisor = ListenerSupervisor::new(fast());
        supervisor.spawn(source, Arc::new(dispatcher)).unwrap();
        (broker, recorder, supervisor)
    }

    #[test]
    fn handles_messages_in_publication_order() {
        let (broker, recorder, supervisor) = setup(0);
        for q in 1..=3 {
            broker.publish("inventory", &changed(q)).unwrap();
        }

        wait_until(|| recorder.seen.lock().unwrap().len() == 3);
        assert_eq!(supervisor.handles()[0].stats().acked(), 3);
        supervisor.shutdown();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn failed_message_is_retried_before_the_next_one() {
        let (broker, recorder, supervisor) = setup(2);
        broker.publish("inventory", &changed(1)).unwrap();
        broker.publish("inventory", &changed(2)).unwrap();

        wait_until(|| recorder.seen.lock().unwrap().len() == 2);
        let nacked = supervisor.handles()[0].stats().nacked();
        supervisor.shutdown();

        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(nacked, 2);
    }

    #[test]
    fn unknown_and_malformed_messages_are_dropped() {
        let (broker, recorder, supervisor) = setup(0);
        broker
            .publish_raw("inventory", br#"{"eventType":"PriceChanged","data":{}}"#)
            .unwrap();
        broker.publish_raw("inventory", b"not json").unwrap();
        broker.publish("inventory", &changed(7)).unwrap();

        wait_until(|| recorder.seen.lock().unwrap().len() == 1);
        wait_until(|| broker.pending_count("inventory", "test") == 0);
        let dropped = supervisor.handles()[0].stats().dropped();
        supervisor.shutdown();

        assert_eq!(dropped, 2);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![7]);
        assert!(broker.dead_letters().is_empty());
    }

    /// Panics on its first call, then records.
    struct PanicsOnce {
        calls: AtomicU64,
        seen: Mutex<Vec<u32>>,
    }

    impl EventHandler for PanicsOnce {
        fn name(&self) -> &'static str {
            "panics_once"
        }

        fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first call fails hard");
            }
            if let IntegrationEvent::InventoryChanged(c) = event {
                self.seen.lock().unwrap().push(c.quantity);
            }
            Ok(())
        }
    }

    #[test]
    fn panicking_handler_gets_the_message_again() {
        let broker = InMemoryBroker::with_max_deliveries(10);
        let source = broker.subscribe("inventory", "test").unwrap();
        let handler = Arc::new(PanicsOnce {
            calls: AtomicU64::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(EventKind::InventoryChanged, handler.clone());
        let mut supervisor = ListenerSupervisor::new(fast());
        supervisor.spawn(source, Arc::new(dispatcher)).unwrap();

        broker.publish("inventory", &changed(4)).unwrap();

        wait_until(|| supervisor.handles()[0].stats().acked() == 1);
        let stats = supervisor.handles()[0].stats();
        let (acked, nacked) = (stats.acked(), stats.nacked());
        let pending = broker.pending_count("inventory", "test");
        supervisor.shutdown();

        assert_eq!(*handler.seen.lock().unwrap(), vec![4]);
        assert_eq!((acked, nacked), (1, 1));
        assert_eq!(pending, 0);
        assert!(broker.dead_letters().is_empty());
    }

    struct FailingSource;

    impl MessageSource for FailingSource {
        fn name(&self) -> &str {
            "broken/source"
        }

        fn receive(&self, _timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
            Err(BrokerError::Connection("refused".into()))
        }

        fn ack(&self, _message_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        fn nack(&self, _message_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[test]
    fn broker_errors_restart_the_loop_until_shutdown() {
        let mut supervisor = ListenerSupervisor::new(fast());
        supervisor
            .spawn(Arc::new(FailingSource), Arc::new(EventDispatcher::new()))
            .unwrap();

        wait_until(|| supervisor.handles()[0].stats().restarts() >= 3);
        assert!(supervisor.handles()[0].stats().restarts() >= 3);
        assert_eq!(supervisor.handles()[0].name(), "broken/source");
        supervisor.shutdown();
    }
}
