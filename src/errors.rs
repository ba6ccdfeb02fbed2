//! Error types for spatial index operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in spatial index operations.
#[derive(Debug, Error)]
pub enum SpatialError {
    /// A caller-supplied argument was rejected, e.g. a shape whose dimension
    /// does not match the index.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lock acquisition exhausted its bounded wait.
    ///
    /// This is not a corruption signal; callers decide whether to retry,
    /// back off, or abort.
    #[error("lock acquisition timed out after {waited:?}")]
    LockTimeout { waited: Duration },

    /// A failure from the backing store while loading or saving a node.
    ///
    /// When a write fails, a rollback is attempted on the connection; the
    /// rollback's own failure is swallowed and the original failure is
    /// carried here.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Failure encoding or decoding a node payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stored page graph is inconsistent: a checksum mismatch, a
    /// dangling page or parent id, or a branch node without children.
    #[error("corrupted index: {0}")]
    Corrupted(String),

    /// The operation is declared in the contract but not implemented by
    /// this engine.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Result type for spatial operations.
pub type SpatialResult<T> = Result<T, SpatialError>;
