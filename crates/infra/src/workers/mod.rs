//! Background threads: local-bus consumers and supervised broker listeners.

pub mod listener;
pub mod projection_worker;
pub mod retry;

pub use listener::{ListenerConfig, ListenerHandle, ListenerStats, ListenerSupervisor};
pub use projection_worker::{ProjectionWorker, WorkerHandle};
pub use retry::RetryPolicy;
