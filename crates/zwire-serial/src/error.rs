//! Error types for the transport layer.

use thiserror::Error;

/// Errors surfaced by controller port implementations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The port could not be opened
    #[error("failed to open controller port {path}: {source}")]
    Open {
        /// Device path that was attempted
        path: String,
        /// Underlying serial error
        #[source]
        source: serialport::Error,
    },

    /// A write to the port failed
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),

    /// The port is not open
    #[error("port is not open")]
    NotOpen,

    /// The port was closed while an operation was in progress
    #[error("port closed")]
    Closed,
}
