//! Index and Bloom filter file persistence
//!
//! Index file layout: `[magic:u32][version:u8][bincode map][crc32:u32]`,
//! where the CRC covers the bincode bytes. Files are written to a `.tmp`
//! sibling and renamed into place so a replacement is atomic.

use crate::error::{EngineError, Result};
use crate::index::IndexEntry;
use crate::storage::event_source::EventSource;
use crate::storage::format::{bloom_file_name, index_file_name};
use crate::storage::SegmentId;
use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32Hasher;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Index file magic: "SIDX"
pub const INDEX_MAGIC: u32 = 0x5844_4953;

/// Index file format version
pub const INDEX_VERSION: u8 = 1;

/// In-memory form of a segment index
pub type IndexMap = HashMap<String, Vec<IndexEntry>>;

/// Persist a segment index, atomically replacing any previous file
pub fn write_index(dir: &Path, segment: SegmentId, entries: &IndexMap) -> Result<()> {
    let payload = bincode::serialize(entries)?;
    let mut hasher = Crc32Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let path = dir.join(index_file_name(segment));
    let tmp = path.with_extension("index.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&INDEX_MAGIC.to_le_bytes())?;
    file.write_all(&[INDEX_VERSION])?;
    file.write_all(&payload)?;
    file.write_all(&crc.to_le_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load and checksum-verify a segment index
pub fn load_index(dir: &Path, segment: SegmentId) -> Result<IndexMap> {
    let path = dir.join(index_file_name(segment));
    let mut bytes = Vec::new();
    File::open(&path)
        .map_err(|e| EngineError::DataFileRead(format!("{}: {e}", path.display())))?
        .read_to_end(&mut bytes)?;

    if bytes.len() < 9 {
        return Err(EngineError::DataFileRead(format!(
            "index file for segment {segment} is truncated"
        )));
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != INDEX_MAGIC {
        return Err(EngineError::DataFileRead(format!(
            "index file for segment {segment} has bad magic {magic:#x}"
        )));
    }
    if bytes[4] != INDEX_VERSION {
        return Err(EngineError::DataFileRead(format!(
            "index file for segment {segment} has unsupported version {}",
            bytes[4]
        )));
    }

    let payload = &bytes[5..bytes.len() - 4];
    let stored_crc = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    let mut hasher = Crc32Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(EngineError::DataFileRead(format!(
            "index file for segment {segment} failed its checksum"
        )));
    }

    Ok(bincode::deserialize(payload)?)
}

/// Build and persist the Bloom filter over the aggregates of a segment
pub fn write_bloom(dir: &Path, segment: SegmentId, entries: &IndexMap, fpp: f64) -> Result<()> {
    let mut bloom: Bloom<String> = Bloom::new_for_fp_rate(entries.len().max(1), fpp);
    for aggregate in entries.keys() {
        bloom.set(aggregate);
    }

    let path = dir.join(bloom_file_name(segment));
    let tmp = path.with_extension("bloom.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&bincode::serialize(&bloom)?)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load the Bloom filter of a segment
pub fn load_bloom(dir: &Path, segment: SegmentId) -> Result<Bloom<String>> {
    let path = dir.join(bloom_file_name(segment));
    let mut bytes = Vec::new();
    File::open(&path)
        .map_err(|e| EngineError::DataFileRead(format!("{}: {e}", path.display())))?
        .read_to_end(&mut bytes)?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Whether the on-disk index of a segment matches the segment's contents.
///
/// Valid means: the file loads and passes its checksum, and every entry's
/// offset decodes to an event with the matching aggregate identifier,
/// sequence number, and token.
pub fn validate_index(dir: &Path, segment: SegmentId, source: &EventSource) -> bool {
    let entries = match load_index(dir, segment) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    // One pass over the segment: offset -> (token, aggregate, sequence)
    let mut positions: HashMap<u32, (u64, String, u64)> = HashMap::new();
    for transaction in source.transactions() {
        let transaction = match transaction {
            Ok(transaction) => transaction,
            Err(_) => return false,
        };
        for (i, (event, offset)) in transaction
            .events
            .iter()
            .zip(&transaction.event_offsets)
            .enumerate()
        {
            positions.insert(
                *offset,
                (
                    transaction.token + i as u64,
                    event.aggregate_identifier.clone(),
                    event.aggregate_sequence_number,
                ),
            );
        }
    }

    for (aggregate, index_entries) in &entries {
        for entry in index_entries {
            match positions.get(&entry.offset) {
                Some((token, stored_aggregate, sequence))
                    if token == &entry.token
                        && stored_aggregate == aggregate
                        && sequence == &entry.sequence_number => {}
                _ => return false,
            }
        }
    }
    true
}
