//! Wire protocol error types.

use thiserror::Error;

/// Errors produced while framing or (de)serializing wire messages.
#[derive(Error, Debug)]
pub enum WireError {
    /// Payload ended before a complete field could be read.
    #[error("truncated payload")]
    Truncated,

    /// Structurally invalid payload.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Declared payload length exceeds what a peer may send.
    #[error("oversized payload: {size} bytes, max {max} bytes")]
    OversizedPayload { size: usize, max: usize },

    /// Command name outside the supported set.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// I/O error from the underlying transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
