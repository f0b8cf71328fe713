//! Service boundary consumed by the transport layer

pub mod service;

pub use service::{Confirmation, EventStore};
