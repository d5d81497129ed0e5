//! # ZWIRE Core
//!
//! Driver engine for Z-Wave Serial API controllers.
//!
//! This crate provides:
//! - Frame encoding and decoding with the Serial API XOR checksum
//! - The single-transaction engine (ACK / response / callback matching,
//!   bounded retry)
//! - Five prioritized send queues with sleeping-node redirection
//! - Per-node interrogation ("query stages") and the node table
//! - Notification fan-out, background polling and snapshot persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Driver                                   │
//! │   (event loop: one transaction in flight, retry, dispatch)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Send queues   │  Node table  │  Poller  │  Notification bus   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Frames                                   │
//! │   (SOF / length / type / function / payload / checksum)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Driver`] owns exactly one controller port. Producers (the public API,
//! the query advancer, the poller, wake-up delivery) enqueue finalised
//! [`Message`]s; the driver task multiplexes them over the link one at a
//! time and routes every inbound frame to the transaction engine, the
//! controller-command state machine or the owning node.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod command_class;
pub mod config;
pub mod driver;
pub mod error;
pub mod node;
pub mod notification;
pub mod persist;
pub mod poll;
pub mod protocol;
pub mod queue;
pub mod stats;
pub mod value;

pub use config::{DriverOptions, QueryStageReset};
pub use driver::{ControllerCommand, ControllerState, Driver};
pub use error::{DriverError, FrameError};
pub use node::{Node, NodeId, QueryStage, MAX_NODES};
pub use notification::Notification;
pub use protocol::message::Message;
pub use queue::{MsgQueue, QueueItem};
pub use stats::DriverStatistics;
pub use value::ValueId;

/// Snapshot schema version written to and required from the on-disk
/// network document.
pub const CONFIG_VERSION: u32 = 3;

/// Maximum number of attempts to deliver one message before it is dropped.
pub const MAX_TRIES: u8 = 3;

/// How long to wait for the transaction to progress before resending.
pub const RETRY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(2000);
