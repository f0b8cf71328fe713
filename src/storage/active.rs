//! Mutable primary segment and the hot layer serving it
//!
//! One writer appends checksummed transactions into a memory-mapped file
//! pre-sized to the segment cap. Readers never touch the writable map: they
//! take positional-read views bounded by the committed watermark, which is
//! published only after a transaction's CRC is in place.

use crate::core::event::Token;
use crate::error::Result;
use crate::storage::event_source::EventSource;
use crate::storage::format::{
    segment_file_name, segment_header, SEGMENT_FOOTER, SEGMENT_FOOTER_SIZE, SEGMENT_HEADER_SIZE,
};
use crate::storage::{SegmentId, SegmentLayer};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Result of trying to append one transaction to the active segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The transaction was committed at the given segment offset
    Appended { offset: u64 },
    /// The segment has no room left; the caller must roll over
    SegmentFull,
}

/// The one mutable segment of a store
pub struct ActiveSegment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    state: Mutex<WriterState>,
    /// Committed byte watermark; readers only see bytes below it
    committed: AtomicU64,
    /// Committed event count
    events: AtomicU64,
}

struct WriterState {
    mmap: MmapMut,
    write_pos: u64,
}

impl ActiveSegment {
    /// Create a fresh segment whose first event will carry `first_token`
    pub fn create(dir: &Path, first_token: Token, size: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(first_token));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let size = size.max(SEGMENT_HEADER_SIZE + SEGMENT_FOOTER_SIZE);
        file.set_len(size)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[..SEGMENT_HEADER_SIZE as usize].copy_from_slice(&segment_header(0));
        mmap.flush_range(0, SEGMENT_HEADER_SIZE as usize)?;

        Ok(Self {
            id: first_token,
            path,
            file,
            state: Mutex::new(WriterState {
                mmap,
                write_pos: SEGMENT_HEADER_SIZE,
            }),
            committed: AtomicU64::new(SEGMENT_HEADER_SIZE),
            events: AtomicU64::new(0),
        })
    }

    /// Reopen an existing segment file as the active segment.
    ///
    /// The caller has already scanned the file: `write_pos` is the end of the
    /// last intact transaction and `event_count` the number of events before
    /// it. Anything past `write_pos` is zeroed out.
    pub fn recover(
        dir: &Path,
        id: SegmentId,
        size: u64,
        write_pos: u64,
        event_count: u64,
    ) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = size
            .max(file.metadata()?.len())
            .max(write_pos + SEGMENT_FOOTER_SIZE);
        file.set_len(size)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[write_pos as usize..].fill(0);
        mmap.flush()?;

        Ok(Self {
            id,
            path,
            file,
            state: Mutex::new(WriterState { mmap, write_pos }),
            committed: AtomicU64::new(write_pos),
            events: AtomicU64::new(event_count),
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed event count
    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::Acquire)
    }

    /// Committed byte watermark
    pub fn committed_len(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Append one encoded transaction.
    ///
    /// The watermark is published only after the full record, CRC included,
    /// is in the map, so a concurrent reader can never observe a torn
    /// transaction.
    pub fn append(&self, record: &[u8], event_count: u64, fsync: bool) -> Result<AppendOutcome> {
        let mut state = self.state.lock().expect("active segment writer poisoned");
        let pos = state.write_pos;
        let end = pos + record.len() as u64;
        if end + SEGMENT_FOOTER_SIZE > state.mmap.len() as u64 {
            return Ok(AppendOutcome::SegmentFull);
        }

        state.mmap[pos as usize..end as usize].copy_from_slice(record);
        state.mmap.flush_range(pos as usize, record.len())?;
        if fsync {
            self.file.sync_data()?;
        }
        state.write_pos = end;
        self.events.fetch_add(event_count, Ordering::AcqRel);
        self.committed.store(end, Ordering::Release);
        Ok(AppendOutcome::Appended { offset: pos })
    }

    /// Grow the backing file so an oversized transaction can occupy a
    /// segment of its own
    pub fn grow(&self, new_size: u64) -> Result<()> {
        let mut state = self.state.lock().expect("active segment writer poisoned");
        if new_size <= state.mmap.len() as u64 {
            return Ok(());
        }
        self.file.set_len(new_size)?;
        state.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Flush committed data and file metadata to disk
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock().expect("active segment writer poisoned");
        state.mmap.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Seal the segment: write the footer, flush, fsync.
    ///
    /// Returns the final file length (committed bytes plus footer). The file
    /// itself is truncated by the layer that takes ownership; pages past the
    /// footer are never touched after sealing.
    pub fn seal(&self) -> Result<u64> {
        let mut state = self.state.lock().expect("active segment writer poisoned");
        let pos = state.write_pos as usize;
        state.mmap[pos..pos + 4].copy_from_slice(&SEGMENT_FOOTER.to_le_bytes());
        state.mmap.flush()?;
        self.file.sync_all()?;
        Ok(state.write_pos + SEGMENT_FOOTER_SIZE)
    }

    /// Snapshot read view over the committed bytes
    pub fn reader(&self, open_gauge: Arc<AtomicI64>) -> Result<EventSource> {
        let file = File::open(&self.path)?;
        let limit = self.committed.load(Ordering::Acquire);
        Ok(EventSource::file(self.id, file, limit, open_gauge))
    }
}

/// Hot layer: owns the active segment, plus the just-sealed one until the
/// completed layer confirms the hand-over
pub struct PrimarySegmentLayer {
    active: RwLock<Arc<ActiveSegment>>,
    retiring: RwLock<Option<Arc<ActiveSegment>>>,
    next: Arc<dyn SegmentLayer>,
    open_gauge: Arc<AtomicI64>,
}

impl PrimarySegmentLayer {
    pub fn new(
        active: Arc<ActiveSegment>,
        next: Arc<dyn SegmentLayer>,
        open_gauge: Arc<AtomicI64>,
    ) -> Self {
        Self {
            active: RwLock::new(active),
            retiring: RwLock::new(None),
            next,
            open_gauge,
        }
    }

    /// The current active segment
    pub fn active(&self) -> Arc<ActiveSegment> {
        self.active.read().expect("primary layer poisoned").clone()
    }

    /// Swap in a fresh active segment, retaining the old one until the
    /// hand-over callback releases it
    pub fn install(&self, new_active: Arc<ActiveSegment>) {
        let old = {
            let mut active = self.active.write().expect("primary layer poisoned");
            std::mem::replace(&mut *active, new_active)
        };
        *self.retiring.write().expect("primary layer poisoned") = Some(old);
    }

    /// Drop the retained just-sealed segment once the layer below serves it
    pub fn release_retired(&self, segment: SegmentId) {
        let mut retiring = self.retiring.write().expect("primary layer poisoned");
        if retiring.as_ref().map(|s| s.id()) == Some(segment) {
            *retiring = None;
        }
    }

    fn retiring(&self) -> Option<Arc<ActiveSegment>> {
        self.retiring.read().expect("primary layer poisoned").clone()
    }
}

impl SegmentLayer for PrimarySegmentLayer {
    fn name(&self) -> &'static str {
        "primary"
    }

    fn next(&self) -> Option<Arc<dyn SegmentLayer>> {
        Some(self.next.clone())
    }

    fn owned_segments(&self) -> Vec<SegmentId> {
        let mut segments = vec![self.active().id()];
        if let Some(retiring) = self.retiring() {
            segments.push(retiring.id());
        }
        segments.sort_unstable_by(|a, b| b.cmp(a));
        segments
    }

    fn contains_segment(&self, segment: SegmentId) -> bool {
        self.active().id() == segment
            || self.retiring().map(|s| s.id()) == Some(segment)
            || self.next.contains_segment(segment)
    }

    fn get_event_source(&self, segment: SegmentId) -> Result<EventSource> {
        let active = self.active();
        if active.id() == segment {
            return active.reader(self.open_gauge.clone());
        }
        if let Some(retiring) = self.retiring() {
            if retiring.id() == segment {
                return retiring.reader(self.open_gauge.clone());
            }
        }
        self.next.get_event_source(segment)
    }

    fn get_segment_for(&self, token: Token) -> Result<SegmentId> {
        let active = self.active();
        if token >= active.id() {
            return Ok(active.id());
        }
        if let Some(retiring) = self.retiring() {
            if token >= retiring.id() {
                return Ok(retiring.id());
            }
        }
        self.next.get_segment_for(token)
    }

    fn first_token(&self) -> Option<Token> {
        if let Some(token) = self.next.first_token() {
            return Some(token);
        }
        if let Some(retiring) = self.retiring() {
            return Some(retiring.id());
        }
        Some(self.active().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::Event;
    use crate::storage::format::encode_transaction;
    use tempfile::TempDir;

    fn sample_event(seq: u64) -> Event {
        Event::builder("a1", seq)
            .payload("TestEvent", vec![0u8; 32])
            .build()
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let active = ActiveSegment::create(dir.path(), 0, 64 * 1024).unwrap();
        let gauge = Arc::new(AtomicI64::new(0));

        let encoded = encode_transaction(&[sample_event(0), sample_event(1)]).unwrap();
        let outcome = active.append(&encoded.bytes, 2, false).unwrap();
        assert!(matches!(
            outcome,
            AppendOutcome::Appended {
                offset: SEGMENT_HEADER_SIZE
            }
        ));
        assert_eq!(active.event_count(), 2);

        let reader = active.reader(gauge).unwrap();
        let events: Vec<_> = reader.events().map(|e| e.unwrap()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].token, 0);
        assert_eq!(events[1].token, 1);
    }

    #[test]
    fn test_reader_snapshot_excludes_later_appends() {
        let dir = TempDir::new().unwrap();
        let active = ActiveSegment::create(dir.path(), 0, 64 * 1024).unwrap();
        let gauge = Arc::new(AtomicI64::new(0));

        let first = encode_transaction(&[sample_event(0)]).unwrap();
        active.append(&first.bytes, 1, false).unwrap();
        let reader = active.reader(gauge).unwrap();

        let second = encode_transaction(&[sample_event(1)]).unwrap();
        active.append(&second.bytes, 1, false).unwrap();

        // The earlier snapshot still sees exactly one event
        assert_eq!(reader.events().count(), 1);
    }

    #[test]
    fn test_signals_full_when_out_of_room() {
        let dir = TempDir::new().unwrap();
        let active = ActiveSegment::create(dir.path(), 0, 1024).unwrap();

        let encoded = encode_transaction(&[sample_event(0)]).unwrap();
        let mut appended = 0u64;
        loop {
            match active.append(&encoded.bytes, 1, false).unwrap() {
                AppendOutcome::Appended { .. } => appended += 1,
                AppendOutcome::SegmentFull => break,
            }
        }
        assert!(appended > 0);
        assert_eq!(active.event_count(), appended);
    }

    #[test]
    fn test_seal_writes_footer() {
        let dir = TempDir::new().unwrap();
        let active = ActiveSegment::create(dir.path(), 5, 4096).unwrap();
        let encoded = encode_transaction(&[sample_event(0)]).unwrap();
        active.append(&encoded.bytes, 1, false).unwrap();

        let final_len = active.seal().unwrap();
        assert_eq!(
            final_len,
            SEGMENT_HEADER_SIZE + encoded.bytes.len() as u64 + SEGMENT_FOOTER_SIZE
        );

        let bytes = std::fs::read(active.path()).unwrap();
        let footer_at = final_len as usize - 4;
        assert_eq!(
            u32::from_le_bytes(bytes[footer_at..footer_at + 4].try_into().unwrap()),
            SEGMENT_FOOTER
        );
    }
}
