//! Segstore: segmented append-only event store
//!
//! The storage engine of an event-sourcing platform: events are appended to
//! checksummed transactions inside immutable segment files, addressed by a
//! global monotonic token, and indexed per segment so replaying a single
//! aggregate touches only the segments that contain it.
//!
//! # Core Concepts
//!
//! - **Token**: global, dense, monotonically increasing position of an event
//! - **Segment**: immutable append-only file covering a contiguous token range
//! - **Layer**: one tier of the segment chain (primary / completed / cold)
//! - **Aggregate**: a domain entity whose events form a gap-free sequence
//!
//! # Example
//!
//! ```no_run
//! use segstore::prelude::*;
//!
//! # async fn example() -> segstore::error::Result<()> {
//! let store = EventStore::open(StorageConfig::new("./storage", "default"))?;
//!
//! let event = Event::builder("order-1", 0)
//!     .aggregate_type("Order")
//!     .payload("OrderPlaced", b"{}".to_vec())
//!     .build();
//! let confirmation = store.append_events(vec![event]).await?;
//! assert_eq!(confirmation.token, 0);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod recovery;
pub mod storage;
pub mod streams;
pub mod transaction;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::api::{Confirmation, EventStore};
    pub use crate::config::{SequenceValidationStrategy, StorageConfig};
    pub use crate::core::{Event, EventBuilder, EventWithToken, Token};
    pub use crate::error::{EngineError, Result};
    pub use crate::storage::{QueryOptions, StorageEngine};
    pub use crate::transaction::TransactionManager;
}
