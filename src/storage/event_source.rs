//! Scoped read access to a single segment
//!
//! An `EventSource` is a reference-counted view over one segment's committed
//! bytes. Acquiring one bumps an open-source gauge; the gauge is released
//! when the last clone drops, on every exit path.

use crate::core::event::{Event, EventWithToken, Token};
use crate::error::{EngineError, Result};
use crate::storage::format::{self, TransactionRecord, SEGMENT_HEADER_SIZE};
use crate::storage::SegmentId;
use memmap2::Mmap;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Reference-counted, bounds-checked read view of one segment
#[derive(Clone)]
pub struct EventSource {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    segment: SegmentId,
    data: SourceData,
    /// Readable byte length: committed data only, header included
    limit: u64,
    open_gauge: Arc<AtomicI64>,
}

enum SourceData {
    /// Immutable mapped segment (completed / cold layers)
    Mapped(Arc<Mmap>),
    /// Positional reads against the still-active segment file
    File(File),
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        self.open_gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

impl EventSource {
    pub(crate) fn mapped(
        segment: SegmentId,
        mmap: Arc<Mmap>,
        limit: u64,
        open_gauge: Arc<AtomicI64>,
    ) -> Self {
        open_gauge.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(SourceInner {
                segment,
                data: SourceData::Mapped(mmap),
                limit,
                open_gauge,
            }),
        }
    }

    pub(crate) fn file(
        segment: SegmentId,
        file: File,
        limit: u64,
        open_gauge: Arc<AtomicI64>,
    ) -> Self {
        open_gauge.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(SourceInner {
                segment,
                data: SourceData::File(file),
                limit,
                open_gauge,
            }),
        }
    }

    /// Segment id, which is also the token of the segment's first event
    pub fn segment(&self) -> SegmentId {
        self.inner.segment
    }

    /// Committed byte length visible to this view
    pub fn committed_len(&self) -> u64 {
        self.inner.limit
    }

    /// Decode the transaction starting at `offset`, or `None` at the end of
    /// this view's committed data
    pub fn read_transaction(&self, offset: u64) -> Result<Option<TransactionRecord>> {
        let limit = self.inner.limit;
        if offset + 4 > limit {
            return Ok(None);
        }
        match &self.inner.data {
            SourceData::Mapped(map) => {
                format::read_transaction_at(&map[..limit as usize], offset as usize)
            }
            SourceData::File(file) => {
                let mut len_buf = [0u8; 4];
                file.read_exact_at(&mut len_buf, offset)
                    .map_err(read_error)?;
                let length = u32::from_le_bytes(len_buf);
                if length == 0 || length == format::SEGMENT_FOOTER {
                    return Ok(None);
                }
                let total = 4 + length as u64 + 4;
                if offset + total > limit {
                    return Err(EngineError::DataFileRead(format!(
                        "truncated transaction at offset {offset}"
                    )));
                }
                let mut record_buf = vec![0u8; total as usize];
                file.read_exact_at(&mut record_buf, offset)
                    .map_err(read_error)?;
                let mut record = format::read_transaction_at(&record_buf, 0)?.ok_or_else(|| {
                    EngineError::DataFileRead(format!("unreadable transaction at offset {offset}"))
                })?;
                for event_offset in &mut record.event_offsets {
                    *event_offset += offset as u32;
                }
                Ok(Some(record))
            }
        }
    }

    /// Decode the single event whose length prefix sits at `offset`
    pub fn read_event(&self, offset: u32) -> Result<Event> {
        let offset = offset as u64;
        let limit = self.inner.limit;
        if offset + 4 > limit {
            return Err(EngineError::DataFileRead(format!(
                "event offset {offset} beyond committed data"
            )));
        }
        match &self.inner.data {
            SourceData::Mapped(map) => {
                format::read_event_at(&map[..limit as usize], offset as usize)
            }
            SourceData::File(file) => {
                let mut len_buf = [0u8; 4];
                file.read_exact_at(&mut len_buf, offset)
                    .map_err(read_error)?;
                let len = u32::from_le_bytes(len_buf) as u64;
                if offset + 4 + len > limit {
                    return Err(EngineError::DataFileRead(format!(
                        "truncated event at offset {offset}"
                    )));
                }
                let mut event_buf = vec![0u8; len as usize];
                file.read_exact_at(&mut event_buf, offset + 4)
                    .map_err(read_error)?;
                Event::decode_bytes(&event_buf)
            }
        }
    }

    /// Forward transaction iterator over this segment, starting at its first
    /// transaction
    pub fn transactions(&self) -> SegmentTransactionIter {
        SegmentTransactionIter {
            source: self.clone(),
            offset: SEGMENT_HEADER_SIZE,
            token: self.inner.segment,
            done: false,
        }
    }

    /// Forward event iterator over this segment
    pub fn events(&self) -> SegmentEventIter {
        SegmentEventIter {
            transactions: self.transactions(),
            buffer: VecDeque::new(),
        }
    }
}

fn read_error(e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::Interrupted {
        EngineError::Transient(e.to_string())
    } else {
        EngineError::DataFileRead(e.to_string())
    }
}

/// A decoded transaction paired with the token of its first event
#[derive(Debug, Clone)]
pub struct TransactionWithToken {
    /// Token of the first event in the transaction
    pub token: Token,
    pub events: Vec<Event>,
    /// Absolute segment offset of each event's length prefix
    pub event_offsets: Vec<u32>,
}

impl TransactionWithToken {
    /// Token of the first event after this transaction
    pub fn next_token(&self) -> Token {
        self.token + self.events.len() as u64
    }
}

/// Forward, single-reader iterator over one segment's transactions
pub struct SegmentTransactionIter {
    source: EventSource,
    offset: u64,
    token: Token,
    done: bool,
}

impl SegmentTransactionIter {
    /// Token of the next transaction this iterator would return
    pub fn current_token(&self) -> Token {
        self.token
    }

    /// Read the next transaction and advance
    pub fn next_transaction(&mut self) -> Result<Option<TransactionWithToken>> {
        if self.done {
            return Ok(None);
        }
        match self.source.read_transaction(self.offset)? {
            None => {
                self.done = true;
                Ok(None)
            }
            Some(record) => {
                let token = self.token;
                self.offset += record.byte_len as u64;
                self.token += record.events.len() as u64;
                Ok(Some(TransactionWithToken {
                    token,
                    events: record.events,
                    event_offsets: record.event_offsets,
                }))
            }
        }
    }
}

impl Iterator for SegmentTransactionIter {
    type Item = Result<TransactionWithToken>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_transaction().transpose()
    }
}

/// Forward iterator over one segment's events with their tokens
pub struct SegmentEventIter {
    transactions: SegmentTransactionIter,
    buffer: VecDeque<EventWithToken>,
}

impl Iterator for SegmentEventIter {
    type Item = Result<EventWithToken>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Some(Ok(event));
            }
            match self.transactions.next_transaction() {
                Err(e) => return Some(Err(e)),
                Ok(None) => return None,
                Ok(Some(transaction)) => {
                    let first = transaction.token;
                    self.buffer.extend(
                        transaction
                            .events
                            .into_iter()
                            .enumerate()
                            .map(|(i, event)| EventWithToken::new(first + i as u64, event)),
                    );
                }
            }
        }
    }
}
