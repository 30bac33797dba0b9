//! Infrastructure layer: storage, the inventory ledger, messaging and the
//! workflows that tie the domain crates together.

pub mod broker;
pub mod command_dispatcher;
pub mod confirmation;
pub mod event_store;
pub mod fanout;
pub mod handlers;
pub mod ledger;
pub mod logistics;
pub mod projections;
pub mod read_model;
pub mod relay;
pub mod reservation;
pub mod workers;
