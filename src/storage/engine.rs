//! Storage engine: append path, token bookkeeping, and the read surface
//!
//! One engine owns one directory of segments. Appends are serialized behind
//! an async writer lock and become visible only after their transaction CRC
//! is committed; reads fan out across the layer chain without blocking the
//! writer.

use crate::config::StorageConfig;
use crate::core::event::{Event, EventWithToken, Token};
use crate::error::{EngineError, Result};
use crate::index::{IndexEntry, IndexManager};
use crate::recovery::{self, SegmentScan};
use crate::storage::active::{ActiveSegment, AppendOutcome, PrimarySegmentLayer};
use crate::storage::completed::CompletedSegmentLayer;
use crate::storage::event_source::{EventSource, SegmentTransactionIter, TransactionWithToken};
use crate::storage::format::{self, bloom_file_name, index_file_name};
use crate::storage::{chain_segments_descending, SegmentId, SegmentLayer};
use crate::streams::EventStream;
use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Directory under the store holding cold-tier segments
const ARCHIVE_DIR: &str = "archive";

/// Segment files opened concurrently during aggregate replay
const PREFETCH_SEGMENT_FILES: usize = 2;

/// Token and timestamp bounds for a range query
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub min_token: Token,
    pub max_token: Token,
    pub min_timestamp: i64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            min_token: 0,
            max_token: Token::MAX,
            min_timestamp: i64::MIN,
        }
    }
}

type CloseListener = Arc<dyn Fn() + Send + Sync>;

enum ActivePlan {
    Fresh { first_token: Token },
    Recover { id: SegmentId, scan: SegmentScan },
}

/// The segmented event store engine for one directory
pub struct StorageEngine {
    config: StorageConfig,
    dir: PathBuf,
    primary: Arc<PrimarySegmentLayer>,
    completed: Arc<CompletedSegmentLayer>,
    index: Arc<IndexManager>,
    writer: tokio::sync::Mutex<()>,
    /// Token the next appended event will receive
    next_token: AtomicU64,
    closed: AtomicBool,
    close_listeners: RwLock<Arc<Vec<CloseListener>>>,
    open_gauge: Arc<AtomicI64>,
}

impl StorageEngine {
    /// Open the engine over the configuration's events directory
    pub fn open(config: StorageConfig) -> Result<Arc<Self>> {
        let dir = config.events_dir();
        Self::open_at(dir, config)
    }

    /// Open the engine over an explicit directory (snapshot stores)
    pub fn open_at(dir: PathBuf, config: StorageConfig) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(&dir)?;
        let open_gauge = Arc::new(AtomicI64::new(0));

        let renamed = recovery::rename_legacy_files(&dir)?;
        if renamed > 0 {
            info!(renamed, dir = %dir.display(), "migrated legacy file names");
        }

        let ids = recovery::scan_segment_ids(&dir)?;
        let mut counts: HashMap<SegmentId, u64> = HashMap::new();
        let mut scans: HashMap<SegmentId, SegmentScan> = HashMap::new();

        // The newest file becomes the primary unless it was cleanly sealed
        let mut completed_ids = ids.clone();
        let active_plan = match ids.last().copied() {
            None => ActivePlan::Fresh { first_token: 0 },
            Some(last) => {
                let scan = recovery::scan_segment(&dir, last, true)?;
                counts.insert(last, scan.event_count);
                if scan.sealed {
                    scans.insert(last, scan);
                    let first_token = last + counts[&last];
                    ActivePlan::Fresh { first_token }
                } else {
                    completed_ids.pop();
                    ActivePlan::Recover { id: last, scan }
                }
            }
        };

        // Scan the rest of the validation window; the scan verifies CRCs
        let window = config.validation_segments.unwrap_or(usize::MAX).max(1);
        let window_start = ids.len().saturating_sub(window);
        for &id in &ids[window_start..] {
            if counts.contains_key(&id) {
                continue;
            }
            let scan = recovery::scan_segment(&dir, id, false)?;
            counts.insert(id, scan.event_count);
            scans.insert(id, scan);
        }
        recovery::validate_continuity(&ids, &counts)?;

        // Layer chain: completed on top of an optional cold tier
        let archive_dir = dir.join(ARCHIVE_DIR);
        let mut cold_ids = Vec::new();
        let cold: Option<Arc<dyn SegmentLayer>> = if archive_dir.is_dir() {
            cold_ids = recovery::scan_segment_ids(&archive_dir)?;
            if cold_ids.is_empty() {
                None
            } else {
                Some(Arc::new(CompletedSegmentLayer::open(
                    "cold",
                    &archive_dir,
                    &cold_ids,
                    None,
                    open_gauge.clone(),
                )?))
            }
        } else {
            None
        };
        let completed = Arc::new(CompletedSegmentLayer::open(
            "completed",
            &dir,
            &completed_ids,
            cold,
            open_gauge.clone(),
        )?);

        let index = Arc::new(IndexManager::new(dir.clone(), config.index_bloom_fpp));
        for &id in &cold_ids {
            index.register_completed_at(id, &archive_dir);
        }

        // Completed segments need a usable index: rebuild what is missing,
        // and verify what falls inside the validation window
        for &id in &completed_ids {
            let has_files =
                dir.join(index_file_name(id)).exists() && dir.join(bloom_file_name(id)).exists();
            let stale = if !has_files {
                true
            } else if id >= ids.get(window_start).copied().unwrap_or(u64::MAX) {
                let source = completed.get_event_source(id)?;
                !index.valid_index(id, &source)
            } else {
                false
            };

            if stale {
                let scan = match scans.remove(&id) {
                    Some(scan) => scan,
                    None => recovery::scan_segment(&dir, id, false)?,
                };
                index.add_to_active_segment(id, scan.entries);
                index.complete(id)?;
                info!(segment = id, "rebuilt segment index");
            } else {
                index.register_completed(id);
            }
        }

        let (active, next_token) = match active_plan {
            ActivePlan::Fresh { first_token } => {
                let active =
                    ActiveSegment::create(&dir, first_token, config.max_segment_size)?;
                index.begin_active(first_token);
                (active, first_token)
            }
            ActivePlan::Recover { id, scan } => {
                let next_token = id + scan.event_count;
                let active = ActiveSegment::recover(
                    &dir,
                    id,
                    config.max_segment_size,
                    scan.write_pos,
                    scan.event_count,
                )?;
                index.begin_active(id);
                index.add_to_active_segment(id, scan.entries);
                (active, next_token)
            }
        };

        let primary = Arc::new(PrimarySegmentLayer::new(
            Arc::new(active),
            completed.clone(),
            open_gauge.clone(),
        ));

        info!(
            dir = %dir.display(),
            segments = completed_ids.len() + cold_ids.len() + 1,
            next_token,
            "storage engine opened"
        );

        Ok(Arc::new(Self {
            config,
            dir,
            primary,
            completed,
            index,
            writer: tokio::sync::Mutex::new(()),
            next_token: AtomicU64::new(next_token),
            closed: AtomicBool::new(false),
            close_listeners: RwLock::new(Arc::new(Vec::new())),
            open_gauge,
        }))
    }

    /// Top of the layer chain
    pub fn head_layer(&self) -> Arc<dyn SegmentLayer> {
        self.primary.clone()
    }

    pub fn index(&self) -> &Arc<IndexManager> {
        &self.index
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// First retained token
    pub fn first_token(&self) -> Token {
        self.primary.first_token().unwrap_or(0)
    }

    /// Last assigned token, or `None` while the store is empty
    pub fn last_token(&self) -> Option<Token> {
        let next = self.next_token.load(Ordering::Acquire);
        if next > self.first_token() {
            Some(next - 1)
        } else {
            None
        }
    }

    /// Token the next append will receive
    pub fn next_token(&self) -> Token {
        self.next_token.load(Ordering::Acquire)
    }

    /// Currently open event sources, for resource accounting
    pub fn open_event_sources(&self) -> i64 {
        self.open_gauge.load(Ordering::Relaxed)
    }

    /// Highest stored sequence number of an aggregate
    pub fn get_last_sequence_number(&self, aggregate: &str) -> Result<Option<u64>> {
        self.index
            .get_last_sequence_number(aggregate, usize::MAX, Token::MAX)
    }

    /// Append one batch of events as a single transaction.
    ///
    /// Completes once the transaction, CRC included, has reached the segment
    /// file; returns the token of the first event in the batch.
    pub async fn store(&self, events: Vec<Event>) -> Result<Token> {
        let _guard = self.writer.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Configuration(
                "storage engine is closed".to_string(),
            ));
        }

        let encoded = format::encode_transaction(&events)?;
        let first_token = self.next_token.load(Ordering::Acquire);

        let mut active = self.primary.active();
        let offset = loop {
            match active.append(
                &encoded.bytes,
                encoded.event_count,
                self.config.fsync_on_commit,
            )? {
                AppendOutcome::Appended { offset } => break offset,
                AppendOutcome::SegmentFull => {
                    self.roll_over(&active, encoded.bytes.len() as u64)?;
                    active = self.primary.active();
                }
            }
        };

        let mut entries = Vec::new();
        for (i, (event, relative)) in events.iter().zip(&encoded.event_offsets).enumerate() {
            if event.is_domain_event() {
                entries.push((
                    event.aggregate_identifier.clone(),
                    IndexEntry {
                        sequence_number: event.aggregate_sequence_number,
                        offset: offset as u32 + relative,
                        token: first_token + i as u64,
                    },
                ));
            }
        }
        if !entries.is_empty() {
            self.index.add_to_active_segment(active.id(), entries);
        }
        self.next_token
            .store(first_token + encoded.event_count, Ordering::Release);
        Ok(first_token)
    }

    /// Seal the active segment and promote it to the completed layer.
    ///
    /// Called under the writer lock. An empty active segment is grown in
    /// place instead so an oversized transaction gets a segment of its own.
    fn roll_over(&self, active: &Arc<ActiveSegment>, record_len: u64) -> Result<()> {
        if active.event_count() == 0 {
            return active.grow(
                format::SEGMENT_HEADER_SIZE + record_len + format::SEGMENT_FOOTER_SIZE,
            );
        }

        let final_len = active.seal()?;
        self.index.complete(active.id())?;

        let next_first = active.id() + active.event_count();
        let new_active = Arc::new(ActiveSegment::create(
            &self.dir,
            next_first,
            self.config.max_segment_size,
        )?);
        self.index.begin_active(next_first);
        self.primary.install(new_active);

        let primary = self.primary.clone();
        let sealed = active.id();
        self.completed
            .handover(sealed, final_len, move || primary.release_retired(sealed))?;
        info!(segment = sealed, next = next_first, "rolled over primary segment");
        Ok(())
    }

    /// Forward iterator over transactions in `[first_token, limit_token)`.
    ///
    /// Transactions are delivered whole: the first one is the transaction
    /// containing `first_token`, and iteration stops once the cursor reaches
    /// `limit_token` (capped at the current end of the store).
    pub fn transaction_iterator(
        &self,
        first_token: Token,
        limit_token: Token,
    ) -> Result<TransactionIterator> {
        let limit = limit_token.min(self.next_token.load(Ordering::Acquire));
        TransactionIterator::new(self.head_layer(), first_token, limit)
    }

    /// Lazy, finite replay of one aggregate's events.
    ///
    /// Index entries are resolved once, segments are visited in ascending
    /// order with up to `events_per_segment_prefetch` events buffered ahead
    /// and at most two segment files open concurrently. Dropping the stream
    /// cancels the producer.
    pub fn events_per_aggregate(
        self: &Arc<Self>,
        aggregate: &str,
        first_sequence: u64,
        last_sequence: u64,
        min_token: Token,
    ) -> EventStream<Event> {
        let (tx, rx) = mpsc::channel(self.config.events_per_segment_prefetch.max(1));
        let engine = self.clone();
        let aggregate = aggregate.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine
                .pump_aggregate(&aggregate, first_sequence, last_sequence, min_token, &tx)
                .await
            {
                let _ = tx.send(Err(e)).await;
            }
        });
        EventStream::new(rx)
    }

    async fn pump_aggregate(
        &self,
        aggregate: &str,
        first_sequence: u64,
        last_sequence: u64,
        min_token: Token,
        tx: &mpsc::Sender<Result<Event>>,
    ) -> Result<()> {
        let resolved = self.index.lookup_aggregate(
            aggregate,
            first_sequence,
            last_sequence,
            usize::MAX,
            min_token,
        )?;
        let layer = self.head_layer();
        let segments: Vec<(SegmentId, Vec<IndexEntry>)> = resolved.into_iter().collect();

        debug_assert!(PREFETCH_SEGMENT_FILES >= 2);
        let mut opened_ahead: Option<(SegmentId, EventSource)> = None;
        for (i, (segment, entries)) in segments.iter().enumerate() {
            let source = match opened_ahead.take() {
                Some((id, source)) if id == *segment => source,
                _ => layer.get_event_source(*segment)?,
            };
            // Open the next segment before draining this one, keeping at
            // most two files open at a time
            if let Some((next_segment, _)) = segments.get(i + 1) {
                opened_ahead = Some((*next_segment, layer.get_event_source(*next_segment)?));
            }

            for entry in entries {
                let event = source.read_event(entry.offset)?;
                // Guard against index windows wider than requested
                if event.aggregate_sequence_number < first_sequence {
                    continue;
                }
                if event.aggregate_sequence_number >= last_sequence {
                    return Ok(());
                }
                if tx.send(Ok(event)).await.is_err() {
                    // Consumer dropped the stream; release sources and stop
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Token of the first event at or after `instant_millis`.
    ///
    /// Scans segments oldest first comparing each segment's first timestamp;
    /// falls back to the first retained token when no segment qualifies.
    pub fn get_token_at(&self, instant_millis: i64) -> Result<Token> {
        let layer = self.head_layer();
        let mut segments = chain_segments_descending(&*layer);
        segments.sort_unstable();
        segments.dedup();

        let mut previous: Option<SegmentId> = None;
        for segment in segments {
            let source = layer.get_event_source(segment)?;
            let first_timestamp = source
                .transactions()
                .next_transaction()?
                .and_then(|tx| tx.events.first().map(|e| e.timestamp));
            let Some(first_timestamp) = first_timestamp else {
                continue;
            };

            if first_timestamp >= instant_millis {
                return match previous {
                    None => Ok(self.first_token()),
                    Some(previous) => {
                        let previous_source = layer.get_event_source(previous)?;
                        for event in previous_source.events() {
                            let event = event?;
                            if event.event.timestamp >= instant_millis {
                                return Ok(event.token);
                            }
                        }
                        Ok(segment)
                    }
                };
            }
            previous = Some(segment);
        }
        Ok(self.first_token())
    }

    /// Scan events newest segment first, feeding each qualifying event to
    /// the predicate. Stops when the predicate returns false, or per segment
    /// once the scan has moved past the requested token and timestamp range.
    pub fn query<F>(&self, options: &QueryOptions, mut predicate: F) -> Result<()>
    where
        F: FnMut(&EventWithToken) -> bool,
    {
        let layer = self.head_layer();
        let mut segments = chain_segments_descending(&*layer);
        segments.sort_unstable_by(|a, b| b.cmp(a));
        segments.dedup();

        for segment in segments {
            if segment > options.max_token {
                continue;
            }
            let source = layer.get_event_source(segment)?;
            let mut min_timestamp_seen = i64::MAX;
            for event in source.events() {
                let event = event?;
                min_timestamp_seen = min_timestamp_seen.min(event.event.timestamp);
                if event.token < options.min_token || event.token > options.max_token {
                    continue;
                }
                if event.event.timestamp < options.min_timestamp {
                    continue;
                }
                if !predicate(&event) {
                    return Ok(());
                }
            }
            if options.min_token > segment {
                return Ok(());
            }
            if options.min_timestamp > min_timestamp_seen {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Compare a replicated transaction against the one stored at `token`
    pub fn validate_transaction(&self, token: Token, expected: &[Event]) -> Result<()> {
        let mismatch = |reason: String| EngineError::ReplicatedTransactionMismatch {
            token,
            reason,
        };

        let mut iterator =
            self.transaction_iterator(token, token.saturating_add(1))?;
        let stored = iterator
            .next_transaction()?
            .ok_or_else(|| mismatch("no transaction stored at token".to_string()))?;

        if stored.token != token {
            return Err(mismatch(format!(
                "stored transaction starts at token {}",
                stored.token
            )));
        }
        if stored.events.len() != expected.len() {
            return Err(mismatch(format!(
                "stored transaction holds {} events, expected {}",
                stored.events.len(),
                expected.len()
            )));
        }
        for (i, (stored_event, expected_event)) in
            stored.events.iter().zip(expected).enumerate()
        {
            if stored_event.encoded() != expected_event.encoded() {
                return Err(mismatch(format!("event at token {} differs", token + i as u64)));
            }
        }
        Ok(())
    }

    /// Register an idempotent, non-blocking close listener.
    ///
    /// The listener set is copy-on-write: registration replaces the vector
    /// wholesale so close never races a mutation.
    pub fn register_close_listener<F: Fn() + Send + Sync + 'static>(&self, listener: F) {
        let mut guard = self.close_listeners.write().expect("listeners poisoned");
        let mut next: Vec<CloseListener> = guard.iter().cloned().collect();
        next.push(Arc::new(listener));
        *guard = Arc::new(next);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the engine: fan out to close listeners exactly once and flush
    /// the active segment. Listener panics are logged, never propagated.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = {
            let mut guard = self.close_listeners.write().expect("listeners poisoned");
            std::mem::replace(&mut *guard, Arc::new(Vec::new()))
        };
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                error!("close listener panicked");
            }
        }
        if let Err(e) = self.primary.active().sync() {
            error!(error = %e, "failed to flush active segment on close");
        }
        info!(dir = %self.dir.display(), "storage engine closed");
    }
}

/// Forward, single-reader iterator over transactions across segments.
///
/// A scoped resource: dropping or closing it releases the underlying
/// event source.
pub struct TransactionIterator {
    layer: Arc<dyn SegmentLayer>,
    cursor: Option<SegmentTransactionIter>,
    pending: Option<TransactionWithToken>,
    current_segment: Option<SegmentId>,
    /// Next token the iterator will deliver
    token: Token,
    limit: Token,
}

impl TransactionIterator {
    fn new(layer: Arc<dyn SegmentLayer>, first_token: Token, limit: Token) -> Result<Self> {
        let mut iterator = Self {
            layer,
            cursor: None,
            pending: None,
            current_segment: None,
            token: first_token,
            limit,
        };
        if first_token < limit {
            iterator.open_segment_containing(first_token)?;
            // Skip forward to the transaction containing the first token
            while let Some(cursor) = iterator.cursor.as_mut() {
                match cursor.next_transaction()? {
                    None => break,
                    Some(transaction) if transaction.next_token() > first_token => {
                        iterator.pending = Some(transaction);
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(iterator)
    }

    fn open_segment_containing(&mut self, token: Token) -> Result<()> {
        let segment = self.layer.get_segment_for(token)?;
        if self.current_segment == Some(segment) {
            return Err(EngineError::DataFileRead(format!(
                "segment chain stalled advancing to token {token}"
            )));
        }
        let source = self.layer.get_event_source(segment)?;
        self.current_segment = Some(segment);
        self.cursor = Some(source.transactions());
        Ok(())
    }

    /// Read the next transaction, or `None` once the cursor reaches the
    /// limit token
    pub fn next_transaction(&mut self) -> Result<Option<TransactionWithToken>> {
        if let Some(transaction) = self.pending.take() {
            self.token = transaction.next_token();
            return Ok(Some(transaction));
        }
        loop {
            if self.token >= self.limit {
                self.close();
                return Ok(None);
            }
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(None);
            };
            match cursor.next_transaction()? {
                Some(transaction) => {
                    self.token = transaction.next_token();
                    return Ok(Some(transaction));
                }
                None => {
                    // Current segment exhausted; move to the segment whose
                    // first token equals the cursor position
                    self.open_segment_containing(self.token)?;
                }
            }
        }
    }

    /// Release the underlying event source
    pub fn close(&mut self) {
        self.cursor = None;
        self.pending = None;
    }
}

impl Iterator for TransactionIterator {
    type Item = Result<TransactionWithToken>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_transaction().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn test_config(root: &std::path::Path) -> StorageConfig {
        StorageConfig::new(root, "default").with_max_segment_size(4096)
    }

    fn open_engine(root: &std::path::Path) -> Arc<StorageEngine> {
        StorageEngine::open(test_config(root)).unwrap()
    }

    fn event(aggregate: &str, seq: u64, timestamp: i64) -> Event {
        Event::builder(aggregate, seq)
            .aggregate_type("Test")
            .payload("TestEvent", format!("payload-{aggregate}-{seq}").into_bytes())
            .timestamp(timestamp)
            .build()
    }

    #[tokio::test]
    async fn test_tokens_are_dense_across_batches() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());

        let first = engine
            .store(vec![
                event("a1", 0, 1_000),
                event("a1", 1, 1_001),
                event("a1", 2, 1_002),
            ])
            .await
            .unwrap();
        let second = engine
            .store(vec![event("a1", 3, 1_003), event("a1", 4, 1_004)])
            .await
            .unwrap();

        assert_eq!(first, 0);
        assert_eq!(second, 3);
        assert_eq!(engine.first_token(), 0);
        assert_eq!(engine.last_token(), Some(4));
    }

    #[tokio::test]
    async fn test_replay_round_trip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());

        let events = vec![
            event("a1", 0, 1_000),
            event("a2", 0, 1_001),
            event("a1", 1, 1_002),
        ];
        engine.store(events.clone()).await.unwrap();

        let mut iterator = engine.transaction_iterator(0, 3).unwrap();
        let transaction = iterator.next_transaction().unwrap().unwrap();
        assert_eq!(transaction.token, 0);
        assert_eq!(transaction.events.len(), 3);
        for (stored, original) in transaction.events.iter().zip(&events) {
            assert_eq!(stored.encoded(), original.encoded());
        }
        assert!(iterator.next_transaction().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollover_keeps_first_token_and_iterator_crosses_boundary() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());

        // Fill until at least one rollover happened
        let mut seq = 0u64;
        while engine.completed.segment_count() == 0 {
            engine
                .store(vec![event("a1", seq, 1_000 + seq as i64)])
                .await
                .unwrap();
            seq += 1;
        }
        let boundary = engine.primary.active().id();
        assert!(boundary > 0);
        engine
            .store(vec![event("a1", seq, 2_000)])
            .await
            .unwrap();

        assert_eq!(engine.first_token(), 0);

        // Iterate across the segment boundary
        let mut iterator = engine
            .transaction_iterator(boundary - 1, boundary + 1)
            .unwrap();
        let before = iterator.next_transaction().unwrap().unwrap();
        assert_eq!(before.token, boundary - 1);
        let after = iterator.next_transaction().unwrap().unwrap();
        assert_eq!(after.token, boundary);
        assert!(iterator.next_transaction().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_per_aggregate_spans_segments_gap_free() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());

        let mut sequences: HashMap<&str, u64> = HashMap::new();
        for i in 0..60i64 {
            let aggregate = if i % 3 == 0 { "other" } else { "a1" };
            let seq = sequences.entry(aggregate).or_insert(0);
            engine
                .store(vec![event(aggregate, *seq, 1_000 + i)])
                .await
                .unwrap();
            *seq += 1;
        }
        assert!(engine.completed.segment_count() > 0, "expected a rollover");

        let stream = engine.events_per_aggregate("a1", 0, u64::MAX, 0);
        let replayed = stream.collect_all().await.unwrap();
        let sequences: Vec<u64> = replayed
            .iter()
            .map(|e| e.aggregate_sequence_number)
            .collect();
        let expected: Vec<u64> = (0..replayed.len() as u64).collect();
        assert_eq!(sequences, expected);
        assert!(replayed.iter().all(|e| e.aggregate_identifier == "a1"));
    }

    #[tokio::test]
    async fn test_events_per_aggregate_sequence_window() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());
        engine
            .store((0..5).map(|seq| event("a1", seq, 1_000)).collect())
            .await
            .unwrap();

        let stream = engine.events_per_aggregate("a1", 1, 4, 0);
        let replayed = stream.collect_all().await.unwrap();
        let sequences: Vec<u64> = replayed.iter().map(|e| e.aggregate_sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_get_token_at_finds_first_event_at_or_after_instant() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());

        for seq in 0..60u64 {
            engine
                .store(vec![event("a1", seq, 1_000 + 10 * seq as i64)])
                .await
                .unwrap();
        }
        assert!(engine.completed.segment_count() > 0);

        // Exact hit and between-events instants
        assert_eq!(engine.get_token_at(1_000).unwrap(), 0);
        assert_eq!(engine.get_token_at(1_105).unwrap(), 11);
        assert_eq!(engine.get_token_at(1_110).unwrap(), 11);
        // Before all data
        assert_eq!(engine.get_token_at(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_scans_newest_first_and_respects_predicate() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());
        for seq in 0..80u64 {
            engine
                .store(vec![event("a1", seq, 1_000 + seq as i64)])
                .await
                .unwrap();
        }
        assert!(engine.completed.segment_count() > 0);

        let mut seen = Vec::new();
        engine
            .query(&QueryOptions::default(), |event| {
                seen.push(event.token);
                true
            })
            .unwrap();
        assert_eq!(seen.len(), 80);
        // Newest segment's tokens come first
        assert!(seen.first().unwrap() > seen.last().unwrap());

        // Token bounds filter and terminate the scan
        let mut bounded = Vec::new();
        engine
            .query(
                &QueryOptions {
                    min_token: 10,
                    max_token: 12,
                    min_timestamp: i64::MIN,
                },
                |event| {
                    bounded.push(event.token);
                    true
                },
            )
            .unwrap();
        bounded.sort_unstable();
        assert_eq!(bounded, vec![10, 11, 12]);

        // Predicate returning false stops immediately
        let calls = AtomicUsize::new(0);
        engine
            .query(&QueryOptions::default(), |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                false
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_validate_transaction_detects_mismatch() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());

        for seq in 0..101u64 {
            engine
                .store(vec![event("a1", seq, 1_000 + seq as i64)])
                .await
                .unwrap();
        }

        let mut iterator = engine.transaction_iterator(100, 101).unwrap();
        let stored = iterator.next_transaction().unwrap().unwrap().events;
        drop(iterator);
        engine.validate_transaction(100, &stored).unwrap();

        let mut modified = stored.clone();
        modified[0].payload = b"tampered".to_vec();
        assert!(matches!(
            engine.validate_transaction(100, &modified),
            Err(EngineError::ReplicatedTransactionMismatch { token: 100, .. })
        ));

        // Absent token
        assert!(matches!(
            engine.validate_transaction(10_000, &stored),
            Err(EngineError::ReplicatedTransactionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_listeners_fire_exactly_once() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());

        let calls = Arc::new(AtomicUsize::new(0));
        let listener_calls = calls.clone();
        engine.register_close_listener(move || {
            listener_calls.fetch_add(1, Ordering::SeqCst);
        });

        engine.close();
        engine.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.is_closed());
        assert!(engine.store(vec![event("a1", 0, 1)]).await.is_err());
    }

    #[tokio::test]
    async fn test_iterator_drop_releases_sources() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(dir.path());
        engine
            .store(vec![event("a1", 0, 1_000)])
            .await
            .unwrap();

        let iterator = engine.transaction_iterator(0, 1).unwrap();
        assert!(engine.open_event_sources() > 0);
        drop(iterator);
        assert_eq!(engine.open_event_sources(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn prop_aggregate_replay_is_gap_free(
            batch_sizes in proptest::collection::vec(1usize..5, 1..12),
            segment_size in 2048u64..8192,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let dir = TempDir::new().unwrap();
                let config = StorageConfig::new(dir.path(), "default")
                    .with_max_segment_size(segment_size);
                let engine = StorageEngine::open(config).unwrap();

                let mut seq = 0u64;
                for batch in &batch_sizes {
                    let events: Vec<Event> = (0..*batch)
                        .map(|i| event("a1", seq + i as u64, 1_000 + seq as i64))
                        .collect();
                    engine.store(events).await.unwrap();
                    seq += *batch as u64;
                }

                let replayed = engine
                    .events_per_aggregate("a1", 0, u64::MAX, 0)
                    .collect_all()
                    .await
                    .unwrap();
                let sequences: Vec<u64> =
                    replayed.iter().map(|e| e.aggregate_sequence_number).collect();
                let expected: Vec<u64> = (0..seq).collect();
                assert_eq!(sequences, expected);
            });
        }
    }
}
