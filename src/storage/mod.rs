//! Segment storage: a layered chain of append-only segment files
//!
//! A segment is identified by the token of its first event. Layers own
//! disjoint sets of segments: the primary layer owns the one mutable
//! segment, the completed layer owns sealed segments on local disk, and an
//! optional cold layer owns archived segments. Lookups fall through the
//! chain from the hottest layer to the coldest via `next`.

pub mod active;
pub mod completed;
pub mod engine;
pub mod event_source;
pub mod format;

pub use active::{ActiveSegment, PrimarySegmentLayer};
pub use completed::CompletedSegmentLayer;
pub use engine::{QueryOptions, StorageEngine, TransactionIterator};
pub use event_source::{EventSource, SegmentEventIter, SegmentTransactionIter, TransactionWithToken};

use crate::core::event::Token;
use crate::error::Result;
use std::sync::Arc;

/// A segment id is the token of the segment's first event
pub type SegmentId = u64;

/// One tier of the segment chain.
///
/// Every fallible lookup delegates to `next` when this layer cannot answer;
/// when `next` is absent the operation fails with `TokenBeforeStart` or
/// `SegmentUnavailable`.
pub trait SegmentLayer: Send + Sync {
    /// Layer name for diagnostics
    fn name(&self) -> &'static str;

    /// The layer below this one, if any
    fn next(&self) -> Option<Arc<dyn SegmentLayer>>;

    /// Segment ids owned by this layer, newest first
    fn owned_segments(&self) -> Vec<SegmentId>;

    /// Whether this layer or any layer below owns the segment
    fn contains_segment(&self, segment: SegmentId) -> bool;

    /// Scoped read access to one segment, delegating on miss
    fn get_event_source(&self, segment: SegmentId) -> Result<EventSource>;

    /// The greatest owned segment id at or below `token`, delegating when
    /// the token precedes every owned segment
    fn get_segment_for(&self, token: Token) -> Result<SegmentId>;

    /// First token retained by this layer or the chain below it.
    ///
    /// Delegates to `next` first and only falls back to this layer's oldest
    /// segment when the chain below holds nothing.
    fn first_token(&self) -> Option<Token>;
}

/// All segment ids in the chain starting at `layer`, newest first
pub fn chain_segments_descending(layer: &dyn SegmentLayer) -> Vec<SegmentId> {
    let mut segments = layer.owned_segments();
    let mut below = layer.next();
    while let Some(layer) = below {
        segments.extend(layer.owned_segments());
        below = layer.next();
    }
    segments
}
