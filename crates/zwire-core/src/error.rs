//! Error types for the driver engine.

use thiserror::Error;

/// Frame-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame body shorter than the two mandatory type/function bytes
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Trailing checksum did not match the body
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    Checksum {
        /// Checksum computed over the body
        expected: u8,
        /// Checksum byte on the wire
        actual: u8,
    },

    /// Payload would not fit in the one-byte length field
    #[error("payload too long for a serial frame: {0} bytes")]
    PayloadTooLong(usize),
}

/// Errors surfaced by driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] zwire_serial::TransportError),

    /// Frame construction or verification failed
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A node id outside 1..=232, or one with no entry in the table
    #[error("unknown node {0}")]
    UnknownNode(u8),

    /// The requested operation needs a bridge controller
    #[error("controller is not a bridge controller")]
    NotBridgeController,

    /// A network-management command is already in progress
    #[error("controller is busy with {0:?}")]
    ControllerBusy(crate::driver::ControllerCommand),

    /// Snapshot could not be read or did not validate
    #[error("snapshot rejected: {0}")]
    Snapshot(String),

    /// Snapshot I/O failure
    #[error("snapshot i/o: {0}")]
    SnapshotIo(#[from] std::io::Error),

    /// The driver is shutting down or was never started
    #[error("driver is not running")]
    NotRunning,

    /// start was called twice
    #[error("driver already started")]
    AlreadyRunning,
}
