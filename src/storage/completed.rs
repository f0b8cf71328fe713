//! Read-only segment layers: completed segments on local disk and the
//! optional cold tier below them
//!
//! Both tiers share this implementation; they differ only in the directory
//! they serve and their position in the chain. Segments are mapped read-only
//! and shared by reference count across concurrent readers.

use crate::core::event::Token;
use crate::error::{EngineError, Result};
use crate::storage::event_source::EventSource;
use crate::storage::format::{
    read_segment_header, segment_file_name, SEGMENT_FOOTER, SEGMENT_FOOTER_SIZE,
};
use crate::storage::{SegmentId, SegmentLayer};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, RwLock};

struct SegmentDescriptor {
    mmap: Arc<Mmap>,
    /// Readable bytes: header plus transactions, footer excluded
    data_len: u64,
}

/// A tier of immutable segments, chained above an optional colder tier
pub struct CompletedSegmentLayer {
    name: &'static str,
    dir: PathBuf,
    segments: RwLock<BTreeMap<SegmentId, Arc<SegmentDescriptor>>>,
    next: Option<Arc<dyn SegmentLayer>>,
    open_gauge: Arc<AtomicI64>,
}

impl CompletedSegmentLayer {
    /// Open the given segments from `dir`
    pub fn open(
        name: &'static str,
        dir: &Path,
        segment_ids: &[SegmentId],
        next: Option<Arc<dyn SegmentLayer>>,
        open_gauge: Arc<AtomicI64>,
    ) -> Result<Self> {
        let mut segments = BTreeMap::new();
        for &id in segment_ids {
            segments.insert(id, Arc::new(open_descriptor(dir, id)?));
        }
        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            segments: RwLock::new(segments),
            next,
            open_gauge,
        })
    }

    /// Take ownership of a just-sealed segment.
    ///
    /// The file is truncated to its final length, mapped read-only and
    /// registered; `on_complete` fires once the segment is servable from
    /// this layer so the primary can release its retained copy.
    pub fn handover<F: FnOnce()>(
        &self,
        segment: SegmentId,
        final_len: u64,
        on_complete: F,
    ) -> Result<()> {
        let path = self.dir.join(segment_file_name(segment));
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(final_len)?;
        file.sync_all()?;

        let descriptor = Arc::new(open_descriptor(&self.dir, segment)?);
        self.segments
            .write()
            .expect("completed layer poisoned")
            .insert(segment, descriptor);
        on_complete();
        Ok(())
    }

    /// Number of segments owned by this layer
    pub fn segment_count(&self) -> usize {
        self.segments.read().expect("completed layer poisoned").len()
    }
}

fn open_descriptor(dir: &Path, id: SegmentId) -> Result<SegmentDescriptor> {
    let path = dir.join(segment_file_name(id));
    let file = File::open(&path)
        .map_err(|e| EngineError::DataFileRead(format!("{}: {e}", path.display())))?;
    let len = file.metadata()?.len();
    let mmap = unsafe { Mmap::map(&file)? };
    read_segment_header(&mmap)?;

    // Sealed segments end with the footer magic; tolerate its absence and
    // let the transaction scan stop at the zeroed tail instead.
    let data_len = if len >= SEGMENT_FOOTER_SIZE {
        let footer_at = (len - SEGMENT_FOOTER_SIZE) as usize;
        let word = u32::from_le_bytes(mmap[footer_at..footer_at + 4].try_into().unwrap());
        if word == SEGMENT_FOOTER {
            len - SEGMENT_FOOTER_SIZE
        } else {
            len
        }
    } else {
        len
    };

    Ok(SegmentDescriptor {
        mmap: Arc::new(mmap),
        data_len,
    })
}

impl SegmentLayer for CompletedSegmentLayer {
    fn name(&self) -> &'static str {
        self.name
    }

    fn next(&self) -> Option<Arc<dyn SegmentLayer>> {
        self.next.clone()
    }

    fn owned_segments(&self) -> Vec<SegmentId> {
        self.segments
            .read()
            .expect("completed layer poisoned")
            .keys()
            .rev()
            .copied()
            .collect()
    }

    fn contains_segment(&self, segment: SegmentId) -> bool {
        if self
            .segments
            .read()
            .expect("completed layer poisoned")
            .contains_key(&segment)
        {
            return true;
        }
        self.next
            .as_ref()
            .map(|next| next.contains_segment(segment))
            .unwrap_or(false)
    }

    fn get_event_source(&self, segment: SegmentId) -> Result<EventSource> {
        let descriptor = self
            .segments
            .read()
            .expect("completed layer poisoned")
            .get(&segment)
            .cloned();
        match descriptor {
            Some(descriptor) => Ok(EventSource::mapped(
                segment,
                descriptor.mmap.clone(),
                descriptor.data_len,
                self.open_gauge.clone(),
            )),
            None => match &self.next {
                Some(next) => next.get_event_source(segment),
                None => Err(EngineError::SegmentUnavailable(segment)),
            },
        }
    }

    fn get_segment_for(&self, token: Token) -> Result<SegmentId> {
        let own = self
            .segments
            .read()
            .expect("completed layer poisoned")
            .range(..=token)
            .next_back()
            .map(|(id, _)| *id);
        match own {
            Some(id) => Ok(id),
            None => match &self.next {
                Some(next) => next.get_segment_for(token),
                None => Err(EngineError::TokenBeforeStart(token)),
            },
        }
    }

    fn first_token(&self) -> Option<Token> {
        if let Some(token) = self.next.as_ref().and_then(|next| next.first_token()) {
            return Some(token);
        }
        self.segments
            .read()
            .expect("completed layer poisoned")
            .keys()
            .next()
            .copied()
    }
}
