//! Event wire model

use crate::core::clock::{Clock, SystemClock};
use crate::error::Result;
use chrono::{DateTime, Utc};
use prost::Message;
use uuid::Uuid;

/// Global, dense, monotonically increasing position of one event in the store
pub type Token = u64;

/// An immutable event record.
///
/// The prost encoding of this message is the on-disk representation of an
/// event inside a transaction; it must stay stable across releases.
#[derive(Clone, PartialEq, Message)]
pub struct Event {
    /// Globally unique message identifier (UUID string)
    #[prost(string, tag = "1")]
    pub message_identifier: String,
    /// Owning aggregate; empty means "not a domain event"
    #[prost(string, tag = "2")]
    pub aggregate_identifier: String,
    /// Type name of the owning aggregate
    #[prost(string, tag = "3")]
    pub aggregate_type: String,
    /// Monotonic per-aggregate sequence number, starting at 0
    #[prost(uint64, tag = "4")]
    pub aggregate_sequence_number: u64,
    /// Milliseconds since the Unix epoch
    #[prost(int64, tag = "5")]
    pub timestamp: i64,
    /// Payload type name
    #[prost(string, tag = "6")]
    pub payload_type: String,
    /// Payload revision
    #[prost(string, tag = "7")]
    pub payload_revision: String,
    /// Serialized payload
    #[prost(bytes = "vec", tag = "8")]
    pub payload: Vec<u8>,
    /// Serialized metadata
    #[prost(bytes = "vec", tag = "9")]
    pub meta_data: Vec<u8>,
    /// True for snapshot records
    #[prost(bool, tag = "10")]
    pub snapshot: bool,
}

impl Event {
    /// Start building an event for the given aggregate
    pub fn builder(aggregate_identifier: &str, sequence_number: u64) -> EventBuilder {
        EventBuilder::new(aggregate_identifier, sequence_number)
    }

    /// Whether this event belongs to an aggregate
    pub fn is_domain_event(&self) -> bool {
        !self.aggregate_identifier.is_empty()
    }

    /// Canonical encoded bytes as persisted on disk
    pub fn encoded(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an event from its persisted bytes
    pub fn decode_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Event::decode(buf)?)
    }

    /// Event timestamp as a UTC datetime, if representable
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// An event paired with its global token
#[derive(Debug, Clone, PartialEq)]
pub struct EventWithToken {
    pub token: Token,
    pub event: Event,
}

impl EventWithToken {
    pub fn new(token: Token, event: Event) -> Self {
        Self { token, event }
    }
}

/// Builder for events
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    /// Create a builder with a fresh message identifier and the current time
    pub fn new(aggregate_identifier: &str, sequence_number: u64) -> Self {
        Self {
            event: Event {
                message_identifier: Uuid::new_v4().to_string(),
                aggregate_identifier: aggregate_identifier.to_string(),
                aggregate_sequence_number: sequence_number,
                timestamp: SystemClock.now_millis(),
                ..Default::default()
            },
        }
    }

    pub fn aggregate_type(mut self, aggregate_type: &str) -> Self {
        self.event.aggregate_type = aggregate_type.to_string();
        self
    }

    pub fn timestamp(mut self, millis: i64) -> Self {
        self.event.timestamp = millis;
        self
    }

    pub fn payload(mut self, payload_type: &str, payload: Vec<u8>) -> Self {
        self.event.payload_type = payload_type.to_string();
        self.event.payload = payload;
        self
    }

    pub fn payload_revision(mut self, revision: &str) -> Self {
        self.event.payload_revision = revision.to_string();
        self
    }

    pub fn meta_data(mut self, meta_data: Vec<u8>) -> Self {
        self.event.meta_data = meta_data;
        self
    }

    pub fn snapshot(mut self, snapshot: bool) -> Self {
        self.event.snapshot = snapshot;
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}
