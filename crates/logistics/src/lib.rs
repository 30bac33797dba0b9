//! Logistics domain module.
//!
//! A `Delivery` is created when an order is confirmed and keeps a
//! point-in-time copy of the order it ships.

pub mod delivery;

pub use delivery::{Delivery, DeliveryLine, DeliveryStatus};
