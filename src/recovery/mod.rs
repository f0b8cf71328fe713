//! Startup validation and crash recovery
//!
//! On open: legacy file suffixes are renamed in place, every segment in the
//! validation window is scanned transaction by transaction (which verifies
//! the CRCs), chain continuity is checked, and missing or stale indices are
//! rebuilt from the segment contents.

use crate::error::{EngineError, Result};
use crate::index::IndexEntry;
use crate::storage::format::{
    self, bloom_file_name, index_file_name, parse_segment_id, read_segment_header,
    segment_file_name, SEGMENT_FOOTER, SEGMENT_HEADER_SIZE,
};
use crate::storage::SegmentId;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Outcome of scanning one segment file
#[derive(Debug)]
pub struct SegmentScan {
    /// Byte offset just past the last intact transaction
    pub write_pos: u64,
    /// Events in the intact prefix
    pub event_count: u64,
    /// Rebuilt index entries for the intact prefix
    pub entries: Vec<(String, IndexEntry)>,
    /// Whether the scan ended at a footer (sealed segment)
    pub sealed: bool,
    /// Whether a torn trailing transaction was dropped
    pub torn_tail: bool,
    /// Timestamp of the segment's first event
    pub first_timestamp: Option<i64>,
}

/// Rename files bearing legacy suffixes to their current names.
///
/// Returns the number of files renamed.
pub fn rename_legacy_files(dir: &Path) -> Result<usize> {
    let legacy = [
        (format::LEGACY_EVENTS_SUFFIX, segment_file_name as fn(u64) -> String),
        (format::LEGACY_INDEX_SUFFIX, index_file_name as fn(u64) -> String),
        (format::LEGACY_BLOOM_SUFFIX, bloom_file_name as fn(u64) -> String),
    ];

    let mut renamed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        for (suffix, current_name) in &legacy {
            if let Some(id) = parse_segment_id(&path, suffix) {
                let target = dir.join(current_name(id));
                fs::rename(&path, &target)?;
                info!(from = %path.display(), to = %target.display(), "renamed legacy file");
                renamed += 1;
                break;
            }
        }
    }
    Ok(renamed)
}

/// Segment ids present in `dir`, sorted ascending
pub fn scan_segment_ids(dir: &Path) -> Result<Vec<SegmentId>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(id) = parse_segment_id(&path, format::EVENTS_SUFFIX) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Scan one segment, verifying its header and every transaction CRC.
///
/// With `tolerate_torn_tail` a corrupt or truncated trailing transaction is
/// treated as the end of committed data (the crashed-writer case); without
/// it the scan fails with `ValidationFailed`.
pub fn scan_segment(
    dir: &Path,
    segment: SegmentId,
    tolerate_torn_tail: bool,
) -> Result<SegmentScan> {
    let path = dir.join(segment_file_name(segment));
    let bytes = fs::read(&path)
        .map_err(|e| EngineError::DataFileRead(format!("{}: {e}", path.display())))?;
    read_segment_header(&bytes)
        .map_err(|e| EngineError::ValidationFailed(format!("segment {segment}: {e}")))?;

    let mut scan = SegmentScan {
        write_pos: SEGMENT_HEADER_SIZE,
        event_count: 0,
        entries: Vec::new(),
        sealed: false,
        torn_tail: false,
        first_timestamp: None,
    };

    loop {
        let offset = scan.write_pos as usize;
        match format::read_transaction_at(&bytes, offset) {
            Ok(None) => {
                if offset + 4 <= bytes.len() {
                    let word = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
                    scan.sealed = word == SEGMENT_FOOTER;
                }
                break;
            }
            Ok(Some(record)) => {
                let first_token = segment + scan.event_count;
                for (i, (event, event_offset)) in record
                    .events
                    .iter()
                    .zip(&record.event_offsets)
                    .enumerate()
                {
                    if scan.first_timestamp.is_none() {
                        scan.first_timestamp = Some(event.timestamp);
                    }
                    if event.is_domain_event() {
                        scan.entries.push((
                            event.aggregate_identifier.clone(),
                            IndexEntry {
                                sequence_number: event.aggregate_sequence_number,
                                offset: *event_offset,
                                token: first_token + i as u64,
                            },
                        ));
                    }
                }
                scan.event_count += record.events.len() as u64;
                scan.write_pos += record.byte_len as u64;
            }
            Err(e) => {
                if tolerate_torn_tail {
                    warn!(
                        segment,
                        offset, error = %e, "dropping torn transaction at segment tail"
                    );
                    scan.torn_tail = true;
                    break;
                }
                return Err(EngineError::ValidationFailed(format!(
                    "segment {segment}: {e}"
                )));
            }
        }
    }
    Ok(scan)
}

/// Check that consecutive segments have dense first tokens.
///
/// `counts` holds the scanned event count per segment; segments outside the
/// validation window are skipped.
pub fn validate_continuity(
    segments: &[SegmentId],
    counts: &HashMap<SegmentId, u64>,
) -> Result<()> {
    for window in segments.windows(2) {
        let (segment, successor) = (window[0], window[1]);
        if let Some(&count) = counts.get(&segment) {
            if segment + count != successor {
                return Err(EngineError::ValidationFailed(format!(
                    "segment gap: segment {segment} holds {count} events but the next segment starts at {successor}"
                )));
            }
        }
    }
    Ok(())
}
