//! Storage engine configuration

use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};

/// Default size cap for a single segment file (256 MiB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

/// Default number of events read ahead per segment during aggregate replay
pub const DEFAULT_EVENTS_PER_SEGMENT_PREFETCH: usize = 32;

/// Default Bloom filter false-positive rate
pub const DEFAULT_INDEX_BLOOM_FPP: f64 = 0.03;

/// Default capacity of the sequence-number cache
pub const DEFAULT_SEQUENCE_CACHE_CAPACITY: usize = 10_000;

/// What to do when a declared aggregate sequence number does not match
/// the next expected one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceValidationStrategy {
    /// Log a warning and accept the declared sequence
    Log,
    /// Reject the append
    Fail,
    /// Skip validation entirely (snapshot stores)
    Off,
}

/// Configuration for one storage context
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory holding all contexts
    pub storage_root: PathBuf,
    /// Context name; becomes a directory component under `storage_root`
    pub context: String,
    /// Size cap after which the primary segment rolls over
    pub max_segment_size: u64,
    /// Events read ahead per segment during aggregate replay
    pub events_per_segment_prefetch: usize,
    /// Restrict startup validation to the newest N segments; `None` validates all
    pub validation_segments: Option<usize>,
    /// Sequence-number validation behavior at reservation time
    pub sequence_validation_strategy: SequenceValidationStrategy,
    /// Bloom filter false-positive rate for segment indices
    pub index_bloom_fpp: f64,
    /// Capacity of the per-aggregate sequence-number cache
    pub sequence_cache_capacity: usize,
    /// Force an fsync on every committed transaction
    pub fsync_on_commit: bool,
}

impl StorageConfig {
    /// Create a configuration with defaults for the given root and context
    pub fn new<P: AsRef<Path>>(storage_root: P, context: &str) -> Self {
        Self {
            storage_root: storage_root.as_ref().to_path_buf(),
            context: context.to_string(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            events_per_segment_prefetch: DEFAULT_EVENTS_PER_SEGMENT_PREFETCH,
            validation_segments: None,
            sequence_validation_strategy: SequenceValidationStrategy::Fail,
            index_bloom_fpp: DEFAULT_INDEX_BLOOM_FPP,
            sequence_cache_capacity: DEFAULT_SEQUENCE_CACHE_CAPACITY,
            fsync_on_commit: false,
        }
    }

    /// Directory holding the event segments of this context
    pub fn events_dir(&self) -> PathBuf {
        self.storage_root.join(&self.context)
    }

    /// Directory holding the snapshot segments of this context
    pub fn snapshots_dir(&self) -> PathBuf {
        self.events_dir().join("snapshots")
    }

    /// Set the segment size cap
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the sequence validation strategy
    pub fn with_sequence_validation(mut self, strategy: SequenceValidationStrategy) -> Self {
        self.sequence_validation_strategy = strategy;
        self
    }

    /// Restrict startup validation to the newest N segments
    pub fn with_validation_segments(mut self, segments: usize) -> Self {
        self.validation_segments = Some(segments);
        self
    }

    /// Check configuration bounds
    pub fn validate(&self) -> Result<()> {
        if self.context.is_empty() {
            return Err(EngineError::Configuration(
                "context name must not be empty".to_string(),
            ));
        }
        if self.max_segment_size > u32::MAX as u64 {
            return Err(EngineError::Configuration(format!(
                "max_segment_size {} exceeds the addressable segment range",
                self.max_segment_size
            )));
        }
        if self.max_segment_size < 1024 {
            return Err(EngineError::Configuration(format!(
                "max_segment_size {} is below the 1 KiB minimum",
                self.max_segment_size
            )));
        }
        if !(self.index_bloom_fpp > 0.0 && self.index_bloom_fpp < 1.0) {
            return Err(EngineError::Configuration(format!(
                "index_bloom_fpp {} must be in (0, 1)",
                self.index_bloom_fpp
            )));
        }
        if self.events_per_segment_prefetch == 0 {
            return Err(EngineError::Configuration(
                "events_per_segment_prefetch must be positive".to_string(),
            ));
        }
        if self.sequence_cache_capacity == 0 {
            return Err(EngineError::Configuration(
                "sequence_cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StorageConfig::new("/tmp/storage", "default");
        config.validate().unwrap();
        assert_eq!(config.events_dir(), PathBuf::from("/tmp/storage/default"));
        assert_eq!(
            config.snapshots_dir(),
            PathBuf::from("/tmp/storage/default/snapshots")
        );
    }

    #[test]
    fn test_rejects_bad_bounds() {
        let config = StorageConfig::new("/tmp/storage", "default").with_max_segment_size(16);
        assert!(config.validate().is_err());

        let mut config = StorageConfig::new("/tmp/storage", "default");
        config.index_bloom_fpp = 1.5;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::new("/tmp/storage", "default");
        config.context = String::new();
        assert!(config.validate().is_err());
    }
}
