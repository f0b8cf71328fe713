//! Per-segment aggregate indices and Bloom filters

pub mod file;
pub mod manager;

pub use manager::{IndexManager, RECENT_ONLY};

use crate::storage::SegmentId;
use serde::{Deserialize, Serialize};

/// Position of one aggregate event inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Per-aggregate sequence number
    pub sequence_number: u64,
    /// Absolute segment offset of the event's length prefix
    pub offset: u32,
    /// Global token of the event
    pub token: u64,
}

/// Index entries for one aggregate inside one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIndexEntries {
    pub segment: SegmentId,
    pub entries: Vec<IndexEntry>,
}
