//! The controller port seam and its serial implementation.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::buffer::ReadBuffer;
use crate::error::TransportError;

/// Function ids of the opening handshake, issued in order once the port is
/// open: GET_VERSION, MEMORY_GET_ID, GET_CONTROLLER_CAPABILITIES,
/// GET_SERIAL_API_CAPABILITIES, GET_SUC_NODE_ID. The driver requests the
/// init data (and, for bridge chips, the virtual node list) from its
/// capabilities handler once these have answered.
pub const INIT_SEQUENCE: &[u8] = &[0x15, 0x20, 0x05, 0x07, 0x56];

/// A byte-stream endpoint to a Z-Wave controller chip.
///
/// Implementations buffer inbound bytes; the driver engine is the only
/// reader. Writes are small (one frame or one signal byte) and synchronous.
#[async_trait]
pub trait ControllerPort: Send + Sync {
    /// Open the endpoint. Returns an error if the device cannot be reached;
    /// the driver retries with backoff.
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the endpoint and stop any pump thread.
    fn close(&self);

    /// Drain up to `buf.len()` buffered bytes. Never blocks.
    fn read(&self, buf: &mut [u8]) -> usize;

    /// Write raw bytes to the device.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Set how many bytes must be buffered before [`readable`] resolves.
    ///
    /// [`readable`]: ControllerPort::readable
    fn set_read_threshold(&self, n: usize);

    /// Wait until the read threshold is met.
    async fn readable(&self);

    /// Function ids of the opening handshake for this endpoint kind.
    ///
    /// HID-serial bridges reorder or extend the sequence; the default is the
    /// plain serial ordering.
    fn init_sequence(&self) -> Vec<u8> {
        INIT_SEQUENCE.to_vec()
    }
}

/// Production port on top of the `serialport` crate.
///
/// A pump thread performs the blocking reads and feeds the shared
/// [`ReadBuffer`]; it exits when the port is closed or the device goes away.
pub struct UsbPort {
    path: String,
    baud: u32,
    buffer: Arc<ReadBuffer>,
    writer: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    open: Arc<AtomicBool>,
}

impl UsbPort {
    /// Default Serial API baud rate.
    pub const BAUD: u32 = 115_200;

    /// Create a port for the device at `path`. Nothing is touched until
    /// [`ControllerPort::open`].
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_baud(path, Self::BAUD)
    }

    /// Create a port with a non-default baud rate.
    pub fn with_baud(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            buffer: Arc::new(ReadBuffer::new()),
            writer: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Device path this port talks to.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn spawn_pump(&self, mut reader: Box<dyn serialport::SerialPort>) -> std::io::Result<()> {
        let buffer = Arc::clone(&self.buffer);
        let open = Arc::clone(&self.open);
        let path = self.path.clone();
        std::thread::Builder::new()
            .name(format!("zwire-pump {path}"))
            .spawn(move || {
                let mut chunk = [0u8; 256];
                while open.load(Ordering::SeqCst) {
                    match reader.read(&mut chunk) {
                        Ok(0) => {}
                        Ok(n) => buffer.push(&chunk[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            tracing::warn!(%path, error = %e, "serial read failed, stopping pump");
                            open.store(false, Ordering::SeqCst);
                        }
                    }
                }
                tracing::debug!(%path, "serial pump stopped");
            })?;
        Ok(())
    }
}

#[async_trait]
impl ControllerPort for UsbPort {
    async fn open(&self) -> Result<(), TransportError> {
        let port = serialport::new(&self.path, self.baud)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(Duration::from_millis(250))
            .open()
            .map_err(|source| TransportError::Open {
                path: self.path.clone(),
                source,
            })?;

        let reader = port.try_clone().map_err(|source| TransportError::Open {
            path: self.path.clone(),
            source,
        })?;

        self.buffer.clear();
        self.open.store(true, Ordering::SeqCst);
        *self.writer.lock().unwrap() = Some(port);
        if let Err(e) = self.spawn_pump(reader) {
            self.close();
            return Err(TransportError::Write(e));
        }

        tracing::info!(path = %self.path, baud = self.baud, "controller port open");
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        *self.writer.lock().unwrap() = None;
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        self.buffer.read(buf)
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut writer = self.writer.lock().unwrap();
        let port = writer.as_mut().ok_or(TransportError::NotOpen)?;
        std::io::Write::write_all(port, data)?;
        Ok(data.len())
    }

    fn set_read_threshold(&self, n: usize) {
        self.buffer.set_threshold(n);
    }

    async fn readable(&self) {
        self.buffer.readable().await;
    }
}
