//! Read models rebuilt from the event store.
//!
//! Projections are disposable: they can be dropped and replayed from the
//! stored streams at any time, and they skip envelopes they have already seen.

pub mod orders;

pub use orders::{OrderFilter, OrderProjectionError, OrderReadModel, OrdersProjection};
