//! Index manager: aggregate lookups across segment indices
//!
//! The manager owns the in-memory index of the active segment and lazily
//! loads the immutable indices of completed segments. Lookups walk segments
//! newest first, skip segments whose Bloom filter excludes the aggregate,
//! and share loaded indices across concurrent readers by reference count.

use crate::error::{EngineError, Result};
use crate::index::file::{self, IndexMap};
use crate::index::{IndexEntry, SegmentIndexEntries};
use crate::storage::event_source::EventSource;
use crate::storage::SegmentId;
use bloomfilter::Bloom;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Sentinel for `get_last_sequence_number`: walk only the most recent
/// segments instead of the whole store
pub const RECENT_ONLY: usize = usize::MAX;

/// Segment walk cap applied when `RECENT_ONLY` is requested
const RECENT_SEGMENT_WALK: usize = 10;

struct ActiveIndex {
    segment: SegmentId,
    entries: IndexMap,
}

struct LoadedIndex {
    entries: IndexMap,
    bloom: Option<Bloom<String>>,
}

impl LoadedIndex {
    fn may_contain(&self, aggregate: &str) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.check(&aggregate.to_string()),
            None => true,
        }
    }
}

/// Owner of all per-segment index state for one store
pub struct IndexManager {
    dir: PathBuf,
    bloom_fpp: f64,
    active: RwLock<Option<ActiveIndex>>,
    /// Completed segments and the directory their index files live in
    completed: RwLock<BTreeMap<SegmentId, PathBuf>>,
    loaded: DashMap<SegmentId, Arc<LoadedIndex>>,
}

impl IndexManager {
    pub fn new(dir: PathBuf, bloom_fpp: f64) -> Self {
        Self {
            dir,
            bloom_fpp,
            active: RwLock::new(None),
            completed: RwLock::new(BTreeMap::new()),
            loaded: DashMap::new(),
        }
    }

    /// Register a completed segment whose index lives in the store directory
    pub fn register_completed(&self, segment: SegmentId) {
        let dir = self.dir.clone();
        self.register_completed_at(segment, &dir);
    }

    /// Register a completed segment served from another directory (cold tier)
    pub fn register_completed_at(&self, segment: SegmentId, dir: &Path) {
        self.completed
            .write()
            .expect("index registry poisoned")
            .insert(segment, dir.to_path_buf());
    }

    /// Start collecting in-memory entries for a new active segment
    pub fn begin_active(&self, segment: SegmentId) {
        *self.active.write().expect("active index poisoned") = Some(ActiveIndex {
            segment,
            entries: IndexMap::new(),
        });
    }

    /// Add committed entries to the active segment's in-memory index.
    ///
    /// Targeting a different segment resets the buffer, which lets recovery
    /// rebuild an arbitrary segment through the same path.
    pub fn add_to_active_segment(&self, segment: SegmentId, entries: Vec<(String, IndexEntry)>) {
        let mut active = self.active.write().expect("active index poisoned");
        let buffer = match active.as_mut() {
            Some(buffer) if buffer.segment == segment => buffer,
            _ => {
                *active = Some(ActiveIndex {
                    segment,
                    entries: IndexMap::new(),
                });
                active.as_mut().unwrap()
            }
        };
        for (aggregate, entry) in entries {
            buffer.entries.entry(aggregate).or_default().push(entry);
        }
    }

    /// Persist the active segment's index and Bloom filter and promote the
    /// segment into the completed registry.
    ///
    /// The active lock is held across the promotion so a concurrent lookup
    /// sees the segment's entries in exactly one place.
    pub fn complete(&self, segment: SegmentId) -> Result<()> {
        let mut active = self.active.write().expect("active index poisoned");
        match active.as_ref() {
            Some(buffer) if buffer.segment == segment => {}
            _ => {
                return Err(EngineError::Configuration(format!(
                    "segment {segment} has no active index to complete"
                )));
            }
        }

        let entries = &active.as_ref().unwrap().entries;
        file::write_index(&self.dir, segment, entries)?;
        file::write_bloom(&self.dir, segment, entries, self.bloom_fpp)?;

        let mut bloom: Bloom<String> =
            Bloom::new_for_fp_rate(entries.len().max(1), self.bloom_fpp);
        for aggregate in entries.keys() {
            bloom.set(aggregate);
        }

        let buffer = active.take().unwrap();
        self.loaded.insert(
            segment,
            Arc::new(LoadedIndex {
                entries: buffer.entries,
                bloom: Some(bloom),
            }),
        );
        self.register_completed(segment);
        debug!(segment, "segment index completed");
        Ok(())
    }

    /// Whether the on-disk index of a segment matches the segment
    pub fn valid_index(&self, segment: SegmentId, source: &EventSource) -> bool {
        file::validate_index(&self.dir, segment, source)
    }

    /// Drop a stale loaded index so the next lookup rereads from disk
    pub fn invalidate(&self, segment: SegmentId) {
        self.loaded.remove(&segment);
    }

    fn index_for(&self, segment: SegmentId) -> Result<Arc<LoadedIndex>> {
        if let Some(loaded) = self.loaded.get(&segment) {
            return Ok(loaded.clone());
        }
        let dir = self
            .completed
            .read()
            .expect("index registry poisoned")
            .get(&segment)
            .cloned()
            .unwrap_or_else(|| self.dir.clone());
        let entries = file::load_index(&dir, segment)?;
        let bloom = file::load_bloom(&dir, segment).ok();
        let loaded = Arc::new(LoadedIndex { entries, bloom });
        self.loaded.insert(segment, loaded.clone());
        Ok(loaded)
    }

    fn completed_descending(&self) -> Vec<SegmentId> {
        self.completed
            .read()
            .expect("index registry poisoned")
            .keys()
            .rev()
            .copied()
            .collect()
    }

    fn active_entries_for(&self, aggregate: &str) -> Option<(SegmentId, Vec<IndexEntry>)> {
        let active = self.active.read().expect("active index poisoned");
        active.as_ref().and_then(|buffer| {
            buffer
                .entries
                .get(aggregate)
                .map(|entries| (buffer.segment, entries.clone()))
        })
    }

    /// Index entries of one aggregate across segments, newest segment first.
    ///
    /// An entry survives only if its token is at least `min_token` and its
    /// sequence number falls in `[first_sequence, last_sequence)`. Once
    /// `max_results` entries are gathered, older segments are skipped.
    pub fn lookup_aggregate(
        &self,
        aggregate: &str,
        first_sequence: u64,
        last_sequence: u64,
        max_results: usize,
        min_token: u64,
    ) -> Result<BTreeMap<SegmentId, Vec<IndexEntry>>> {
        let mut results = BTreeMap::new();
        let mut gathered = 0usize;

        let keep = |entry: &IndexEntry| {
            entry.token >= min_token
                && entry.sequence_number >= first_sequence
                && entry.sequence_number < last_sequence
        };

        if let Some((segment, entries)) = self.active_entries_for(aggregate) {
            let surviving: Vec<IndexEntry> = entries.into_iter().filter(|e| keep(e)).collect();
            if !surviving.is_empty() {
                gathered += surviving.len();
                results.insert(segment, surviving);
            }
        }

        for segment in self.completed_descending() {
            if gathered >= max_results {
                break;
            }
            let index = self.index_for(segment)?;
            if !index.may_contain(aggregate) {
                continue;
            }
            let Some(entries) = index.entries.get(aggregate) else {
                continue;
            };
            let surviving: Vec<IndexEntry> =
                entries.iter().copied().filter(|e| keep(e)).collect();
            if !surviving.is_empty() {
                gathered += surviving.len();
                results.insert(segment, surviving);
            }
        }

        Ok(results)
    }

    /// The newest segment holding the aggregate at or below `max_sequence`,
    /// with the qualifying entries
    pub fn last_index_entries(
        &self,
        aggregate: &str,
        max_sequence: u64,
    ) -> Result<Option<SegmentIndexEntries>> {
        if let Some((segment, entries)) = self.active_entries_for(aggregate) {
            let entries: Vec<IndexEntry> = entries
                .into_iter()
                .filter(|e| e.sequence_number <= max_sequence)
                .collect();
            if !entries.is_empty() {
                return Ok(Some(SegmentIndexEntries { segment, entries }));
            }
        }

        for segment in self.completed_descending() {
            let index = self.index_for(segment)?;
            if !index.may_contain(aggregate) {
                continue;
            }
            let Some(entries) = index.entries.get(aggregate) else {
                continue;
            };
            let entries: Vec<IndexEntry> = entries
                .iter()
                .copied()
                .filter(|e| e.sequence_number <= max_sequence)
                .collect();
            if !entries.is_empty() {
                return Ok(Some(SegmentIndexEntries { segment, entries }));
            }
        }
        Ok(None)
    }

    /// Highest sequence number of an aggregate, walking segments newest
    /// first up to `max_segments_hint` segments and short-circuiting on the
    /// first hit. Entries above `max_token_hint` are ignored.
    pub fn get_last_sequence_number(
        &self,
        aggregate: &str,
        max_segments_hint: usize,
        max_token_hint: u64,
    ) -> Result<Option<u64>> {
        let budget = if max_segments_hint == RECENT_ONLY {
            RECENT_SEGMENT_WALK
        } else {
            max_segments_hint
        };
        let mut walked = 0usize;

        if let Some((_, entries)) = self.active_entries_for(aggregate) {
            let hit = entries
                .into_iter()
                .filter(|e| e.token <= max_token_hint)
                .map(|e| e.sequence_number)
                .max();
            if hit.is_some() {
                return Ok(hit);
            }
        }
        walked += 1;

        for segment in self.completed_descending() {
            if walked >= budget {
                return Ok(None);
            }
            walked += 1;
            let index = self.index_for(segment)?;
            if !index.may_contain(aggregate) {
                continue;
            }
            let hit = index.entries.get(aggregate).and_then(|entries| {
                entries
                    .iter()
                    .filter(|e| e.token <= max_token_hint)
                    .map(|e| e.sequence_number)
                    .max()
            });
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(sequence_number: u64, offset: u32, token: u64) -> IndexEntry {
        IndexEntry {
            sequence_number,
            offset,
            token,
        }
    }

    /// Three segments: 0 and 10 completed, 20 active.
    /// "a1" has sequences 0..3 spread over all three; "a2" lives in segment 10.
    fn populated_manager(dir: &TempDir) -> IndexManager {
        let manager = IndexManager::new(dir.path().to_path_buf(), 0.03);

        manager.begin_active(0);
        manager.add_to_active_segment(
            0,
            vec![
                ("a1".to_string(), entry(0, 10, 0)),
                ("a1".to_string(), entry(1, 90, 1)),
            ],
        );
        manager.complete(0).unwrap();

        manager.begin_active(10);
        manager.add_to_active_segment(
            10,
            vec![
                ("a1".to_string(), entry(2, 10, 10)),
                ("a2".to_string(), entry(0, 90, 11)),
            ],
        );
        manager.complete(10).unwrap();

        manager.begin_active(20);
        manager.add_to_active_segment(20, vec![("a1".to_string(), entry(3, 10, 20))]);
        manager
    }

    #[test]
    fn test_lookup_spans_active_and_completed() {
        let dir = TempDir::new().unwrap();
        let manager = populated_manager(&dir);

        let results = manager
            .lookup_aggregate("a1", 0, u64::MAX, usize::MAX, 0)
            .unwrap();
        assert_eq!(results.keys().copied().collect::<Vec<_>>(), vec![0, 10, 20]);
        assert_eq!(results[&0].len(), 2);
        assert_eq!(results[&10].len(), 1);
        assert_eq!(results[&20].len(), 1);
    }

    #[test]
    fn test_lookup_filters_sequence_range_and_min_token() {
        let dir = TempDir::new().unwrap();
        let manager = populated_manager(&dir);

        // Sequence window [1, 3) keeps sequences 1 and 2 only
        let results = manager
            .lookup_aggregate("a1", 1, 3, usize::MAX, 0)
            .unwrap();
        let sequences: Vec<u64> = results
            .values()
            .flatten()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2]);

        // min_token 10 drops everything in segment 0
        let results = manager
            .lookup_aggregate("a1", 0, u64::MAX, usize::MAX, 10)
            .unwrap();
        assert!(!results.contains_key(&0));
        assert!(results.contains_key(&10));
    }

    #[test]
    fn test_lookup_early_termination_skips_older_segments() {
        let dir = TempDir::new().unwrap();
        let manager = populated_manager(&dir);

        // One result satisfied from the newest (active) segment alone
        let results = manager.lookup_aggregate("a1", 0, u64::MAX, 1, 0).unwrap();
        assert_eq!(results.keys().copied().collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn test_last_index_entries_picks_newest_qualifying_segment() {
        let dir = TempDir::new().unwrap();
        let manager = populated_manager(&dir);

        let newest = manager.last_index_entries("a1", u64::MAX).unwrap().unwrap();
        assert_eq!(newest.segment, 20);

        // Capping max_sequence below the active segment's entries walks back
        let capped = manager.last_index_entries("a1", 2).unwrap().unwrap();
        assert_eq!(capped.segment, 10);
        assert_eq!(capped.entries, vec![entry(2, 10, 10)]);

        assert!(manager.last_index_entries("missing", u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_last_sequence_number_hint_idempotence() {
        let dir = TempDir::new().unwrap();
        let manager = populated_manager(&dir);

        let with_exact = manager
            .get_last_sequence_number("a1", 3, u64::MAX)
            .unwrap();
        let with_larger = manager
            .get_last_sequence_number("a1", 100, u64::MAX)
            .unwrap();
        let with_recent = manager
            .get_last_sequence_number("a1", RECENT_ONLY, u64::MAX)
            .unwrap();
        assert_eq!(with_exact, Some(3));
        assert_eq!(with_larger, Some(3));
        assert_eq!(with_recent, Some(3));

        // a2 only exists in segment 10; a one-segment budget misses it
        assert_eq!(
            manager.get_last_sequence_number("a2", 1, u64::MAX).unwrap(),
            None
        );
        assert_eq!(
            manager.get_last_sequence_number("a2", 3, u64::MAX).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn test_loaded_indices_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let manager = populated_manager(&dir);
            drop(manager);
        }

        // Fresh manager reads completed indices back from disk
        let manager = IndexManager::new(dir.path().to_path_buf(), 0.03);
        manager.register_completed(0);
        manager.register_completed(10);
        let results = manager
            .lookup_aggregate("a2", 0, u64::MAX, usize::MAX, 0)
            .unwrap();
        assert_eq!(results.keys().copied().collect::<Vec<_>>(), vec![10]);
    }
}
