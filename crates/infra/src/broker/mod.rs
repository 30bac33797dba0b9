//! Message broker boundary for integration events.
//!
//! Topics carry encoded [`IntegrationEvent`]s. Every named subscription on a
//! topic gets its own copy of each message and tracks delivery on its own:
//! a message stays pending until it is acked, and a nacked message is handed
//! out again ahead of anything newer. After `max_deliveries` nacks it moves to
//! a dead-letter area instead.
//!
//! - [`InMemoryBroker`]: single-process queues (default, tests)
//! - `RedisStreamsBroker`: Redis Streams consumer groups (feature `redis`)

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use pharmaflow_events::{IntegrationEvent, InventoryChanged};

use crate::ledger::InventoryChangePublisher;

pub use in_memory::{DeadLetter, InMemoryBroker};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;

/// Order lifecycle events from the orders service.
pub const ORDERS_TOPIC: &str = "orders";
/// Stock arrivals and stock movements.
pub const INVENTORY_TOPIC: &str = "inventory";

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("broker command error: {0}")]
    Command(String),
    #[error("event could not be encoded: {0}")]
    Encode(String),
    #[error("subscription closed")]
    Closed,
}

/// One delivery of one message to one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub id: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

pub trait MessagePublisher: Send + Sync {
    fn publish(&self, topic: &str, event: &IntegrationEvent) -> Result<(), BrokerError>;
}

impl<P> MessagePublisher for Arc<P>
where
    P: MessagePublisher + ?Sized,
{
    fn publish(&self, topic: &str, event: &IntegrationEvent) -> Result<(), BrokerError> {
        (**self).publish(topic, event)
    }
}

/// The consuming end of one (topic, subscription) pair.
pub trait MessageSource: Send + Sync {
    /// `"topic/subscription"`, for logs.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the next message.
    fn receive(&self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError>;

    fn ack(&self, message_id: &str) -> Result<(), BrokerError>;

    /// Hand the message back for redelivery (or dead-letter it).
    fn nack(&self, message_id: &str) -> Result<(), BrokerError>;
}

/// A broker that can open subscriptions.
pub trait Broker: MessagePublisher {
    /// Open (or join) a named subscription. Messages published after this
    /// call returns are retained for it.
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageSource>, BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageSource>, BrokerError> {
        (**self).subscribe(topic, subscription)
    }
}

/// Publishes ledger movements to [`INVENTORY_TOPIC`].
pub struct BrokerChangePublisher {
    publisher: Arc<dyn MessagePublisher>,
}

impl BrokerChangePublisher {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { publisher }
    }
}

impl InventoryChangePublisher for BrokerChangePublisher {
    fn publish_change(&self, change: InventoryChanged) {
        let product_id = change.product_id.clone();
        if let Err(err) = self
            .publisher
            .publish(INVENTORY_TOPIC, &IntegrationEvent::InventoryChanged(change))
        {
            error!(product_id = %product_id, error = %err, "failed to publish inventory change");
        }
    }
}
