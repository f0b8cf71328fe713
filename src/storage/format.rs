//! Segment binary format: transaction framing and checksums
//!
//! ```text
//! file:  [version:u8=2][flags:u32] (transaction)* [footer:u32]
//! tx:    [length:u32][version:u8=2][count:u16] (event)* [crc32:u32]
//! event: [length:u32][encoded event bytes]
//! ```
//!
//! `length` counts the bytes between the length word and the CRC, which is
//! exactly the range the CRC covers. A zero length word marks the end of
//! committed data in a still-active segment; the footer magic marks a sealed
//! segment and is a value no transaction length can take.

use crate::core::event::Event;
use crate::error::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use std::path::Path;

/// Segment file format version
pub const SEGMENT_VERSION: u8 = 2;

/// Transaction record version
pub const TRANSACTION_VERSION: u8 = 2;

/// Segment header size: version byte plus flags word
pub const SEGMENT_HEADER_SIZE: u64 = 5;

/// Footer magic written when a segment is sealed
pub const SEGMENT_FOOTER: u32 = 0xFFFF_FFFF;

/// Footer size in bytes
pub const SEGMENT_FOOTER_SIZE: u64 = 4;

/// Current file suffixes
pub const EVENTS_SUFFIX: &str = "events";
pub const INDEX_SUFFIX: &str = "index";
pub const BLOOM_SUFFIX: &str = "bloom";

/// Legacy suffixes recognized and renamed at startup
pub const LEGACY_EVENTS_SUFFIX: &str = "data";
pub const LEGACY_INDEX_SUFFIX: &str = "idx";
pub const LEGACY_BLOOM_SUFFIX: &str = "bf";

/// File name of the segment whose first event has the given token
pub fn segment_file_name(first_token: u64) -> String {
    format!("{first_token:020}.{EVENTS_SUFFIX}")
}

/// File name of the index sibling
pub fn index_file_name(first_token: u64) -> String {
    format!("{first_token:020}.{INDEX_SUFFIX}")
}

/// File name of the Bloom filter sibling
pub fn bloom_file_name(first_token: u64) -> String {
    format!("{first_token:020}.{BLOOM_SUFFIX}")
}

/// Parse a segment id from a file path with the given suffix
pub fn parse_segment_id(path: &Path, suffix: &str) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{suffix}"))?;
    stem.parse().ok()
}

/// A serialized transaction ready to be appended to a segment
#[derive(Debug, Clone)]
pub struct EncodedTransaction {
    /// Full record bytes, length word through CRC
    pub bytes: Bytes,
    /// Offset of each event's length prefix, relative to the record start
    pub event_offsets: Vec<u32>,
    /// Number of events in the record
    pub event_count: u64,
}

/// Serialize a batch of events as a single checksummed transaction
pub fn encode_transaction(events: &[Event]) -> Result<EncodedTransaction> {
    if events.is_empty() {
        return Err(EngineError::Serialization(
            "a transaction must contain at least one event".to_string(),
        ));
    }
    if events.len() > u16::MAX as usize {
        return Err(EngineError::Serialization(format!(
            "transaction of {} events exceeds the {} event cap",
            events.len(),
            u16::MAX
        )));
    }

    let mut body = BytesMut::new();
    body.put_u8(TRANSACTION_VERSION);
    body.put_u16_le(events.len() as u16);

    let mut event_offsets = Vec::with_capacity(events.len());
    for event in events {
        // offset is relative to the record start: 4-byte length word + body so far
        event_offsets.push(4 + body.len() as u32);
        let encoded = event.encoded();
        body.put_u32_le(encoded.len() as u32);
        body.put_slice(&encoded);
    }

    let mut hasher = Crc32Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut record = BytesMut::with_capacity(4 + body.len() + 4);
    record.put_u32_le(body.len() as u32);
    record.put_slice(&body);
    record.put_u32_le(crc);

    Ok(EncodedTransaction {
        bytes: record.freeze(),
        event_offsets,
        event_count: events.len() as u64,
    })
}

/// A transaction decoded from segment bytes
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub version: u8,
    pub events: Vec<Event>,
    /// Absolute offset of each event's length prefix within the segment
    pub event_offsets: Vec<u32>,
    /// Total bytes consumed, length word through CRC
    pub byte_len: usize,
}

/// Decode the transaction starting at `offset`, verifying its CRC.
///
/// Returns `None` at the end of committed data: a zero length word, the
/// footer magic, or insufficient bytes for a length word.
pub fn read_transaction_at(buf: &[u8], offset: usize) -> Result<Option<TransactionRecord>> {
    if offset + 4 > buf.len() {
        return Ok(None);
    }
    let length = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
    if length == 0 || length == SEGMENT_FOOTER {
        return Ok(None);
    }
    let length = length as usize;
    if length < 3 || offset + 4 + length + 4 > buf.len() {
        return Err(EngineError::DataFileRead(format!(
            "truncated transaction at offset {offset}"
        )));
    }

    let body = &buf[offset + 4..offset + 4 + length];
    let stored_crc = u32::from_le_bytes(
        buf[offset + 4 + length..offset + 8 + length]
            .try_into()
            .unwrap(),
    );
    let mut hasher = Crc32Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(EngineError::DataFileRead(format!(
            "transaction checksum mismatch at offset {offset}"
        )));
    }

    let version = body[0];
    if version != TRANSACTION_VERSION {
        return Err(EngineError::DataFileRead(format!(
            "unsupported transaction version {version} at offset {offset}"
        )));
    }
    let count = u16::from_le_bytes(body[1..3].try_into().unwrap()) as usize;

    let mut events = Vec::with_capacity(count);
    let mut event_offsets = Vec::with_capacity(count);
    let mut pos = 3;
    for _ in 0..count {
        if pos + 4 > body.len() {
            return Err(EngineError::DataFileRead(format!(
                "truncated event length at offset {}",
                offset + 4 + pos
            )));
        }
        let event_len = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        event_offsets.push((offset + 4 + pos) as u32);
        pos += 4;
        if pos + event_len > body.len() {
            return Err(EngineError::DataFileRead(format!(
                "truncated event data at offset {}",
                offset + 4 + pos
            )));
        }
        events.push(Event::decode_bytes(&body[pos..pos + event_len])?);
        pos += event_len;
    }

    Ok(Some(TransactionRecord {
        version,
        events,
        event_offsets,
        byte_len: 4 + length + 4,
    }))
}

/// Read a single length-prefixed event at an absolute segment offset
pub fn read_event_at(buf: &[u8], offset: usize) -> Result<Event> {
    if offset + 4 > buf.len() {
        return Err(EngineError::DataFileRead(format!(
            "event offset {offset} out of bounds"
        )));
    }
    let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
    if offset + 4 + len > buf.len() {
        return Err(EngineError::DataFileRead(format!(
            "truncated event at offset {offset}"
        )));
    }
    Event::decode_bytes(&buf[offset + 4..offset + 4 + len])
}

/// Segment header bytes: version plus flags
pub fn segment_header(flags: u32) -> [u8; SEGMENT_HEADER_SIZE as usize] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0] = SEGMENT_VERSION;
    header[1..5].copy_from_slice(&flags.to_le_bytes());
    header
}

/// Parse and validate a segment header, returning its flags
pub fn read_segment_header(buf: &[u8]) -> Result<u32> {
    if buf.len() < SEGMENT_HEADER_SIZE as usize {
        return Err(EngineError::DataFileRead(
            "segment smaller than its header".to_string(),
        ));
    }
    if buf[0] != SEGMENT_VERSION {
        return Err(EngineError::DataFileRead(format!(
            "unsupported segment version {}",
            buf[0]
        )));
    }
    Ok(u32::from_le_bytes(buf[1..5].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_event(aggregate: &str, seq: u64) -> Event {
        Event::builder(aggregate, seq)
            .aggregate_type("Test")
            .payload("TestEvent", format!("payload-{seq}").into_bytes())
            .timestamp(1_700_000_000_000 + seq as i64)
            .build()
    }

    #[test]
    fn test_transaction_round_trip() {
        let events = vec![sample_event("a1", 0), sample_event("a1", 1)];
        let encoded = encode_transaction(&events).unwrap();
        assert_eq!(encoded.event_count, 2);

        let record = read_transaction_at(&encoded.bytes, 0).unwrap().unwrap();
        assert_eq!(record.version, TRANSACTION_VERSION);
        assert_eq!(record.events, events);
        assert_eq!(record.byte_len, encoded.bytes.len());
        assert_eq!(record.event_offsets.len(), 2);

        // Each recorded offset must decode to the matching event
        for (event, offset) in events.iter().zip(&record.event_offsets) {
            let read = read_event_at(&encoded.bytes, *offset as usize).unwrap();
            assert_eq!(&read, event);
        }
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let events = vec![sample_event("a1", 0)];
        let encoded = encode_transaction(&events).unwrap();
        let mut corrupted = encoded.bytes.to_vec();
        let mid = corrupted.len() / 2;
        corrupted[mid] ^= 0xFF;

        let result = read_transaction_at(&corrupted, 0);
        assert!(matches!(result, Err(EngineError::DataFileRead(_))));
    }

    #[test]
    fn test_end_markers() {
        assert!(read_transaction_at(&0u32.to_le_bytes(), 0).unwrap().is_none());
        assert!(read_transaction_at(&SEGMENT_FOOTER.to_le_bytes(), 0)
            .unwrap()
            .is_none());
        assert!(read_transaction_at(&[0u8; 2], 0).unwrap().is_none());
    }

    #[test]
    fn test_rejects_empty_transaction() {
        assert!(encode_transaction(&[]).is_err());
    }

    #[test]
    fn test_segment_header_round_trip() {
        let header = segment_header(0);
        assert_eq!(read_segment_header(&header).unwrap(), 0);

        let mut bad = header;
        bad[0] = 9;
        assert!(read_segment_header(&bad).is_err());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(segment_file_name(42), "00000000000000000042.events");
        assert_eq!(
            parse_segment_id(Path::new("00000000000000000042.events"), EVENTS_SUFFIX),
            Some(42)
        );
        assert_eq!(
            parse_segment_id(Path::new("00000000000000000042.events"), INDEX_SUFFIX),
            None
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip_preserves_events(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                1..16,
            )
        ) {
            let events: Vec<Event> = payloads
                .into_iter()
                .enumerate()
                .map(|(i, payload)| {
                    Event::builder("agg", i as u64)
                        .payload("PropEvent", payload)
                        .build()
                })
                .collect();

            let encoded = encode_transaction(&events).unwrap();
            let record = read_transaction_at(&encoded.bytes, 0).unwrap().unwrap();
            prop_assert_eq!(record.events, events);
            prop_assert_eq!(record.byte_len, encoded.bytes.len());
        }
    }
}
