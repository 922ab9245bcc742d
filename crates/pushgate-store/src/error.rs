//! Error types for the metric store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for checkpoint encoding and I/O.
pub type PersistResult<T> = Result<T, PersistError>;

/// Errors raised while writing or reading a checkpoint.
///
/// Every variant except `Io`/`Encode` on the write path means the file on
/// disk cannot be trusted; restoring from it must not fall back to an
/// empty store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("not a checkpoint file (bad magic)")]
    BadMagic,

    #[error("unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),

    #[error("checkpoint truncated at byte {offset}")]
    Truncated { offset: usize },

    #[error("corrupt checkpoint at byte {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },

    #[error("checkpoint checksum mismatch")]
    ChecksumMismatch,

    #[error("checkpoint claims {expected} records but holds {found}")]
    CountMismatch { expected: u64, found: u64 },
}

/// Errors surfaced by the [`MetricStore`](crate::MetricStore) facade.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("metric store already shut down")]
    AlreadyShutDown,

    #[error("metric store is not running")]
    NotRunning,

    #[error("writer task failed: {0}")]
    WriterPanicked(String),
}
