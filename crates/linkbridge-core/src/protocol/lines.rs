//! Newline framing
//!
//! Bytes arrive in arbitrary chunks; a line is complete once `\n` is seen.
//! A `\r` directly before the newline is stripped.

use std::io;
use std::time::{Duration, Instant};

use super::stream::{is_timeout, LinkChannel};
use super::MAX_LINE_LEN;

/// Buffers input and yields complete lines
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Empty framer
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Append freshly read bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_LINE_LEN && !self.buffer.contains(&b'\n') {
            tracing::warn!(
                "discarding {} bytes without a line terminator",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Take the oldest complete line, if any
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whether a complete line is already buffered
    pub fn has_line(&self) -> bool {
        self.buffer.contains(&b'\n')
    }

    /// Number of buffered bytes not yet returned
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// One bounded read attempt
///
/// Returns a buffered line without touching the channel when one is ready.
/// A read timeout is `Ok(None)`; any other I/O error is returned.
pub fn read_line(
    channel: &mut dyn LinkChannel,
    framer: &mut LineFramer,
) -> io::Result<Option<String>> {
    if let Some(line) = framer.next_line() {
        return Ok(Some(line));
    }

    let mut chunk = [0u8; 256];
    match channel.read(&mut chunk) {
        Ok(0) => Ok(None),
        Ok(n) => {
            framer.push(&chunk[..n]);
            Ok(framer.next_line())
        }
        Err(ref e) if is_timeout(e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Keep reading until a line arrives, `timeout` has elapsed or `cancelled` returns true
///
/// `cancelled` is checked once per read attempt, so it is honoured within one
/// read timeout.
pub fn read_line_within(
    channel: &mut dyn LinkChannel,
    framer: &mut LineFramer,
    timeout: Duration,
    mut cancelled: impl FnMut() -> bool,
) -> io::Result<Option<String>> {
    let start = Instant::now();
    loop {
        if let Some(line) = read_line(channel, framer)? {
            return Ok(Some(line));
        }
        if start.elapsed() >= timeout || cancelled() {
            return Ok(None);
        }
    }
}
