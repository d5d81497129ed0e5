//! Scripted in-memory controller port.
//!
//! Tests (and the protocol simulator) feed inbound bytes with
//! [`MockPort::inject`] and observe what the driver wrote with
//! [`MockPort::take_written`] / [`MockPort::wait_for_write`]. The read side
//! reuses the production [`ReadBuffer`], so threshold and signal behaviour is
//! identical to a real port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::buffer::ReadBuffer;
use crate::error::TransportError;
use crate::port::ControllerPort;

/// In-memory [`ControllerPort`] for tests.
#[derive(Default)]
pub struct MockPort {
    buffer: ReadBuffer,
    written: Mutex<Vec<u8>>,
    write_signal: Notify,
    open: AtomicBool,
    fail_open: AtomicBool,
}

impl MockPort {
    /// Create a closed mock port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent [`ControllerPort::open`] calls fail (startup backoff
    /// tests).
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Feed bytes that the driver will read as if they came from the chip.
    pub fn inject(&self, data: &[u8]) {
        self.buffer.push(data);
    }

    /// Take and clear everything the driver has written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }

    /// Bytes written and not yet taken.
    pub fn written_len(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    /// Wait until at least `n` bytes have been written and not yet taken.
    pub async fn wait_for_write(&self, n: usize) {
        loop {
            let notified = self.write_signal.notified();
            if self.written_len() >= n {
                return;
            }
            notified.await;
        }
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControllerPort for MockPort {
    async fn open(&self) -> Result<(), TransportError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        self.buffer.read(buf)
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        self.written.lock().unwrap().extend_from_slice(data);
        self.write_signal.notify_waiters();
        Ok(data.len())
    }

    fn set_read_threshold(&self, n: usize) {
        self.buffer.set_threshold(n);
    }

    async fn readable(&self) {
        self.buffer.readable().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_then_read_round_trip() {
        let port = MockPort::new();
        port.open().await.unwrap();

        port.inject(&[0x01, 0x03, 0x00, 0x15, 0xe9]);
        port.readable().await;

        let mut buf = [0u8; 8];
        let n = port.read(&mut buf);
        assert_eq!(&buf[..n], &[0x01, 0x03, 0x00, 0x15, 0xe9]);
    }

    #[tokio::test]
    async fn writes_are_observable() {
        let port = MockPort::new();
        port.open().await.unwrap();

        port.write(&[0x06]).unwrap();
        port.wait_for_write(1).await;
        assert_eq!(port.take_written(), vec![0x06]);
        assert_eq!(port.written_len(), 0);
    }

    #[tokio::test]
    async fn write_fails_when_closed() {
        let port = MockPort::new();
        assert!(port.write(&[0x06]).is_err());
    }
}
