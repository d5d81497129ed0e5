//! # ZWIRE Serial
//!
//! Byte transport layer for the ZWIRE driver engine.
//!
//! A Z-Wave controller chip is attached to the host over a serial tty (or a
//! HID endpoint presenting as one). This crate owns that boundary:
//!
//! - [`ControllerPort`] - the transport seam the driver engine programs
//!   against: open/close, non-blocking reads out of a shared buffer, raw
//!   writes, a settable read threshold and a waitable "bytes available"
//!   signal
//! - [`ReadBuffer`] - the buffered reader behind every port implementation
//! - [`UsbPort`] - the production implementation on top of the `serialport`
//!   crate, with a pump thread feeding the read buffer
//! - [`MockPort`] - a scripted in-memory port for tests and simulation
//!
//! The driver engine is the only reader; producers never touch the port.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod mock;
pub mod port;

pub use buffer::ReadBuffer;
pub use error::TransportError;
pub use mock::MockPort;
pub use port::{ControllerPort, UsbPort, INIT_SEQUENCE};
