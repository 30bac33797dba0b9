//! `pharmaflow-events`: event mechanics shared by every service.
//!
//! Two kinds of events live here:
//! - **domain events** of an aggregate, persisted in its stream and fanned out
//!   in-process through an [`EventBus`];
//! - **integration events** ([`IntegrationEvent`]) that cross service
//!   boundaries through the broker, with their wire envelope and the
//!   in-process [`EventDispatcher`] that routes them to handlers.

pub mod bus;
pub mod dispatch;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod integration;

pub use bus::{EventBus, Subscription};
pub use dispatch::{EventDispatcher, EventHandler, HandlerError, HandlerFailure};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use integration::{
    ConfirmedLine, DecodeError, Decoded, EventKind, InventoryAssigned, InventoryChanged,
    IntegrationEvent, LineQuantity, OrderCancelled, OrderConfirmed, OrderDelivered,
    StockChangeKind,
};
