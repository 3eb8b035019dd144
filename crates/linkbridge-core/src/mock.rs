//! In-memory serial devices
//!
//! Lets the validator, worker and controller run without hardware. A
//! [`MockDevice`] is a cloneable handle shared between the test and every
//! channel opened on it, so a test can inject lines, pull the plug and
//! inspect what was written while the worker owns the port.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::{LinkChannel, LinkError, PortDescriptor, PortOpener};

/// Longest a mock read blocks before reporting a timeout
const MAX_MOCK_READ_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct DeviceState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    probe: u8,
    reply: Option<String>,
    plugged: bool,
    generation: u64,
    open_channels: usize,
    opens: usize,
}

/// A simulated line-oriented device
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    fn with_reply(reply: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                rx: VecDeque::new(),
                tx: Vec::new(),
                probe: b'?',
                reply,
                plugged: true,
                generation: 0,
                open_channels: 0,
                opens: 0,
            })),
        }
    }

    /// Device answering the `?` probe with `reply`
    pub fn responding(reply: impl Into<String>) -> Self {
        Self::with_reply(Some(reply.into()))
    }

    /// Device that never answers a probe
    pub fn silent() -> Self {
        Self::with_reply(None)
    }

    /// Change the probe byte the device reacts to
    pub fn with_probe(self, probe: u8) -> Self {
        self.lock().probe = probe;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not hide the device from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a line (terminator added) for the host to read
    pub fn emit(&self, line: &str) {
        let mut state = self.lock();
        state.rx.extend(line.as_bytes());
        state.rx.push_back(b'\n');
    }

    /// Queue raw bytes for the host to read
    pub fn emit_raw(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes);
    }

    /// Change how the device answers future probes
    pub fn set_reply(&self, reply: Option<&str>) {
        self.lock().reply = reply.map(str::to_string);
    }

    /// Simulate the cable being pulled: open channels fail and reopening is refused
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.plugged = false;
        state.generation += 1;
        state.rx.clear();
    }

    /// Make the device reachable again
    pub fn replug(&self) {
        let mut state = self.lock();
        state.plugged = true;
        state.rx.clear();
    }

    /// Whether a channel on this device is currently open
    pub fn is_open(&self) -> bool {
        self.lock().open_channels > 0
    }

    /// How many times the device has been opened
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Every byte the host has written, probes included
    pub fn written(&self) -> Vec<u8> {
        self.lock().tx.clone()
    }

    /// Complete lines the host has written, probe bytes removed
    pub fn sent_lines(&self) -> Vec<String> {
        let state = self.lock();
        let probe = state.probe;
        let text: Vec<u8> = state.tx.iter().copied().filter(|&b| b != probe).collect();
        let text = String::from_utf8_lossy(&text);
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        // Whatever follows the last terminator is incomplete
        lines.pop();
        lines
    }

    fn open_channel(&self, read_timeout: Duration) -> Result<MockChannel, LinkError> {
        let mut state = self.lock();
        if !state.plugged {
            return Err(LinkError::SerialError("device unplugged".to_string()));
        }
        state.opens += 1;
        state.open_channels += 1;
        Ok(MockChannel {
            device: self.clone(),
            generation: state.generation,
            read_timeout,
        })
    }
}

/// A channel on a [`MockDevice`]
pub struct MockChannel {
    device: MockDevice,
    generation: u64,
    read_timeout: Duration,
}

impl MockChannel {
    fn check_link(&self, state: &DeviceState) -> io::Result<()> {
        if !state.plugged || state.generation != self.generation {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        Ok(())
    }
}

impl Read for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.device.lock();
            self.check_link(&state)?;
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(self.read_timeout.min(MAX_MOCK_READ_WAIT));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for MockChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        self.check_link(&state)?;
        state.tx.extend_from_slice(buf);
        if buf == [state.probe] {
            if let Some(reply) = state.reply.clone() {
                state.rx.extend(reply.as_bytes());
                state.rx.push_back(b'\n');
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let state = self.device.lock();
        self.check_link(&state)
    }
}

impl LinkChannel for MockChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        let mut state = self.device.lock();
        self.check_link(&state)?;
        state.rx.clear();
        Ok(())
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        let mut state = self.device.lock();
        state.open_channels = state.open_channels.saturating_sub(1);
    }
}

/// Opens [`MockDevice`]s by port path
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockOpener {
    /// Opener with no ports attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `device` reachable at `path`
    pub fn attach(&self, path: impl Into<String>, device: MockDevice) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), device);
    }
}

impl PortOpener for MockOpener {
    fn open(&self, descriptor: &PortDescriptor) -> Result<Box<dyn LinkChannel>, LinkError> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&descriptor.path)
            .cloned()
            .ok_or_else(|| LinkError::SerialError(format!("{}: no such port", descriptor.path)))?;
        Ok(Box::new(device.open_channel(descriptor.read_timeout)?))
    }
}
