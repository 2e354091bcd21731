//! Error types for the marshalling boundary.

use thiserror::Error;

/// Marshalling errors
#[derive(Debug, Error)]
pub enum MarshalError {
    /// I/O error from the underlying byte stream
    #[error("marshalling I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec-level failure (undecodable or over-limit object graph)
    #[error("codec error: {0}")]
    Codec(String),

    /// Object graph nesting exceeded the configured depth limit
    #[error("object graph too deep: exceeded {0} levels")]
    TooDeep(usize),

    /// A resolver stage rejected an object
    #[error("resolver error: {0}")]
    Resolver(String),

    /// Buffer pool has no free buffers
    #[error("buffer pool exhausted")]
    PoolExhausted,
}
