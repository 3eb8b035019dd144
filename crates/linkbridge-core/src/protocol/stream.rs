//! Open port abstraction
//!
//! The worker and the handshake only see [`LinkChannel`], so tests can swap
//! the serial port for an in-memory device.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::serial::{clear_buffers, open_port, PortDescriptor};
use super::LinkError;

/// Abstraction over an open, byte-oriented device link
pub trait LinkChannel: Read + Write + Send {
    /// Set timeout for subsequent read operations
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard anything pending in the input and output buffers
    fn clear_buffers(&mut self) -> io::Result<()>;
}

/// Turns a port descriptor into an open channel
///
/// The production implementation is [`SerialOpener`]; tests inject their own.
pub trait PortOpener: Send + Sync {
    /// Open and configure the port described by `descriptor`
    fn open(&self, descriptor: &PortDescriptor) -> Result<Box<dyn LinkChannel>, LinkError>;
}

/// Opens real serial ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, descriptor: &PortDescriptor) -> Result<Box<dyn LinkChannel>, LinkError> {
        let port = open_port(descriptor)?;
        Ok(Box::new(SerialChannel::new(
            port,
            descriptor.read_timeout,
            descriptor.write_timeout,
        )))
    }
}

/// Serial port wrapper implementing LinkChannel
///
/// `serialport` has a single timeout for both directions, so the wrapper
/// switches it lazily when the direction changes.
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    read_timeout: Duration,
    write_timeout: Duration,
    active_timeout: Duration,
}

impl SerialChannel {
    /// Wrap an opened port with per-direction timeouts
    pub fn new(port: Box<dyn SerialPort>, read_timeout: Duration, write_timeout: Duration) -> Self {
        let active_timeout = port.timeout();
        Self {
            port,
            read_timeout,
            write_timeout,
            active_timeout,
        }
    }

    fn ensure_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if self.active_timeout != timeout {
            self.port
                .set_timeout(timeout)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            self.active_timeout = timeout;
        }
        Ok(())
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_timeout(self.read_timeout)?;
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_timeout(self.write_timeout)?;
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl LinkChannel for SerialChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        clear_buffers(self.port.as_mut()).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Whether an I/O error only means "nothing arrived within the timeout"
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
