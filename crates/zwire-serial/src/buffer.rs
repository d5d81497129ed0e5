//! Shared read buffer with threshold signalling.
//!
//! Every port implementation pumps inbound bytes into a [`ReadBuffer`]; the
//! driver engine waits on [`ReadBuffer::readable`] and then drains with
//! [`ReadBuffer::read`]. The threshold lets the framer wait for a whole frame
//! body instead of waking once per byte.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Buffered inbound bytes plus the "bytes available" signal.
///
/// The signal is level-triggered: `readable` resolves whenever at least
/// `threshold` bytes are buffered, however long they have been sitting there.
#[derive(Debug)]
pub struct ReadBuffer {
    bytes: Mutex<VecDeque<u8>>,
    threshold: AtomicUsize,
    notify: Notify,
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBuffer {
    /// Create an empty buffer with a threshold of one byte.
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new(VecDeque::new()),
            threshold: AtomicUsize::new(1),
            notify: Notify::new(),
        }
    }

    /// Append inbound bytes and wake any waiter.
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let mut bytes = self.bytes.lock().unwrap();
            bytes.extend(data.iter().copied());
        }
        self.notify.notify_waiters();
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set the number of bytes that must be buffered before `readable`
    /// resolves.
    pub fn set_threshold(&self, n: usize) {
        self.threshold.store(n.max(1), Ordering::SeqCst);
        // A waiter may already be satisfied by the lower threshold.
        self.notify.notify_waiters();
    }

    /// Wait until at least the threshold number of bytes is buffered.
    pub async fn readable(&self) {
        loop {
            let notified = self.notify.notified();
            if self.len() >= self.threshold.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Drain up to `buf.len()` bytes into `buf`, returning the count moved.
    /// Never blocks.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut bytes = self.bytes.lock().unwrap();
        let n = buf.len().min(bytes.len());
        for slot in buf.iter_mut().take(n) {
            *slot = bytes.pop_front().unwrap();
        }
        n
    }

    /// Discard everything buffered (used when resyncing after an aborted
    /// frame read at open time).
    pub fn clear(&self) {
        self.bytes.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn readable_resolves_when_threshold_met() {
        let buf = Arc::new(ReadBuffer::new());
        buf.set_threshold(3);
        buf.push(&[0x01, 0x02]);

        let waiter = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.readable().await })
        };
        // Two bytes buffered, threshold three: the waiter must still be parked.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        buf.push(&[0x03]);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn readable_is_level_triggered() {
        let buf = ReadBuffer::new();
        buf.push(&[0xaa]);
        // Bytes arrived before anyone waited; readable must not hang.
        buf.readable().await;

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 1);
        assert_eq!(out[0], 0xaa);
    }

    #[test]
    fn read_drains_in_order() {
        let buf = ReadBuffer::new();
        buf.push(&[1, 2, 3, 4, 5]);
        let mut out = [0u8; 3];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn lowering_threshold_wakes_waiter() {
        let buf = Arc::new(ReadBuffer::new());
        buf.set_threshold(10);
        buf.push(&[0u8; 4]);

        let waiter = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.readable().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        buf.set_threshold(2);
        waiter.await.unwrap();
    }
}
