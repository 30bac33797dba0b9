//! Orders domain module (event-sourced).
//!
//! The `Order` aggregate owns the order lifecycle and its lines. Deterministic
//! domain logic only: stock reservation and persistence are driven from the
//! infra crate.

pub mod diagnostics;
pub mod order;

pub use diagnostics::{ConfirmRejection, LineDiagnostic, LineProblem};
pub use order::{
    AddLine, CancelOrder, ConfirmOrder, CreateOrder, CustomerAssigned, ItemAdded,
    ItemQuantityUpdated, ItemRemoved, MarkDelivered, MarkInTransit, Order, OrderCancelled,
    OrderCommand, OrderConfirmed, OrderCreated, OrderDelivered, OrderEvent, OrderInTransit,
    OrderLine, OrderStatus, RemoveLine, SetCustomer, UpdateLineQuantity,
};
