//! `pharmaflow-core`: shared domain building blocks.
//!
//! Pure domain primitives only: identifiers, the domain error model and the
//! aggregate contract. Nothing in here performs IO.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{
    AggregateId, CustomerId, DeliveryId, LotId, OrderId, ProductId, SellerId, WarehouseId,
};
