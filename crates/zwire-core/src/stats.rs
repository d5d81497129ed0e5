//! Cumulative driver statistics.

use std::sync::atomic::{AtomicU32, Ordering};

/// Internal counters, bumped lock-free from the driver task.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub sof_cnt: AtomicU32,
    pub ack_waiting: AtomicU32,
    pub read_aborts: AtomicU32,
    pub bad_checksum: AtomicU32,
    pub read_cnt: AtomicU32,
    pub write_cnt: AtomicU32,
    pub can_cnt: AtomicU32,
    pub nak_cnt: AtomicU32,
    pub ack_cnt: AtomicU32,
    pub oof_cnt: AtomicU32,
    pub dropped: AtomicU32,
    pub retries: AtomicU32,
    pub controller_read_cnt: AtomicU32,
    pub controller_write_cnt: AtomicU32,
}

impl Counters {
    pub fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DriverStatistics {
        DriverStatistics {
            sof_cnt: self.sof_cnt.load(Ordering::Relaxed),
            ack_waiting: self.ack_waiting.load(Ordering::Relaxed),
            read_aborts: self.read_aborts.load(Ordering::Relaxed),
            bad_checksum: self.bad_checksum.load(Ordering::Relaxed),
            read_cnt: self.read_cnt.load(Ordering::Relaxed),
            write_cnt: self.write_cnt.load(Ordering::Relaxed),
            can_cnt: self.can_cnt.load(Ordering::Relaxed),
            nak_cnt: self.nak_cnt.load(Ordering::Relaxed),
            ack_cnt: self.ack_cnt.load(Ordering::Relaxed),
            oof_cnt: self.oof_cnt.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            controller_read_cnt: self.controller_read_cnt.load(Ordering::Relaxed),
            controller_write_cnt: self.controller_write_cnt.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStatistics {
    /// SOF bytes seen
    pub sof_cnt: u32,
    /// Frames that arrived while an ACK was outstanding
    pub ack_waiting: u32,
    /// Frame reads abandoned on the 100/500 ms deadlines
    pub read_aborts: u32,
    /// Frames rejected for a bad checksum
    pub bad_checksum: u32,
    /// Frames received and verified
    pub read_cnt: u32,
    /// Frames written
    pub write_cnt: u32,
    /// CAN signal bytes received
    pub can_cnt: u32,
    /// NAK signal bytes received
    pub nak_cnt: u32,
    /// ACK signal bytes received
    pub ack_cnt: u32,
    /// Out-of-frame bytes received
    pub oof_cnt: u32,
    /// Messages dropped after exhausting the retry budget
    pub dropped: u32,
    /// Message retransmissions
    pub retries: u32,
    /// Frames received for the controller itself
    pub controller_read_cnt: u32,
    /// Frames written targeting the controller itself
    pub controller_write_cnt: u32,
}
