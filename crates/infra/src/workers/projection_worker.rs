use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use pharmaflow_events::{EventBus, Subscription};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic bus-consumer loop used by projections and the outbox relay.
///
/// - Subscribes to an event bus before returning, so nothing published after
///   `spawn` is missed
/// - Applies the handler to every message, in order
/// - Stops on shutdown or when the bus goes away
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a worker thread that processes events from the bus subscription.
    ///
    /// `handler` must be idempotent: the bus is at-least-once.
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: B,
        mut handler: H,
    ) -> std::io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: EventBus<M> + Send + Sync + 'static,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &mut handler))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            debug!(worker = name, "worker shutting down");
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "worker handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use pharmaflow_events::InMemoryEventBus;

    #[test]
    fn worker_processes_messages_in_order_until_shutdown() {
        let bus = Arc::new(InMemoryEventBus::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let handle = ProjectionWorker::spawn("test-worker", bus.clone(), move |m: u32| {
            sink.lock().unwrap().push(m);
            Ok::<(), ()>(())
        })
        .unwrap();

        for i in 1..=3 {
            bus.publish(i).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
