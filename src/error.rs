//! Error types for the segmented event store

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the storage engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Per-aggregate sequence mismatch detected at reservation time
    #[error("invalid sequence number for aggregate {aggregate}: expected {expected}, got {got}")]
    InvalidSequence {
        aggregate: String,
        expected: u64,
        got: u64,
    },

    /// A segment id that no layer can serve
    #[error("segment {0} is not available in any layer")]
    SegmentUnavailable(u64),

    /// Requested token precedes the first retained token
    #[error("token {0} precedes the first retained token")]
    TokenBeforeStart(u64),

    /// I/O or corruption at the data file level
    #[error("data file read error: {0}")]
    DataFileRead(String),

    /// Startup continuity or CRC violation; the store refuses to open
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Replicated content does not match local content at the same token
    #[error("replicated transaction at token {token} does not match local data: {reason}")]
    ReplicatedTransactionMismatch { token: u64, reason: String },

    /// Producer cancelled the append before completion
    #[error("append cancelled before completion")]
    AppendCancelled,

    /// Retriable I/O failure
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<prost::DecodeError> for EngineError {
    fn from(e: prost::DecodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<prost::EncodeError> for EngineError {
    fn from(e: prost::EncodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
