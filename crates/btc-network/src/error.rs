//! Network error types.

use thiserror::Error;

/// Errors surfaced by the engine and its listeners.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Could not bind a local listening socket.
    #[error("bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Wire protocol failure.
    #[error("wire error: {0}")]
    Wire(#[from] btc_wire::WireError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
