//! Handshake-based device validation
//!
//! A candidate port is only accepted once the device behind it answers the
//! probe byte with a line containing the expected token.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::lines::{read_line_within, LineFramer};
use super::serial::{PortDescriptor, PortEnumerator};
use super::stream::{LinkChannel, PortOpener};
use super::LinkError;
use crate::config::LinkConfig;
use crate::worker::StopSignal;

/// Probe/response parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSettings {
    /// Wait after opening before talking to the device.
    /// Boards that reset when the port opens ignore input until they have booted.
    pub settle_delay: Duration,
    /// How long to wait for the response line
    pub timeout: Duration,
    /// Byte written to ask the device to identify itself
    pub probe: u8,
    /// Substring the response line must contain
    pub token: String,
}

impl HandshakeSettings {
    /// Settings taken from the handshake fields of `config`
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            settle_delay: Duration::from_millis(config.handshake_settle_ms),
            timeout: Duration::from_millis(config.handshake_timeout_ms),
            probe: config.handshake_probe,
            token: config.handshake_token.clone(),
        }
    }
}

/// A port whose device passed the handshake, still open
pub struct ConfirmedPort {
    /// How the port was opened
    pub descriptor: PortDescriptor,
    /// The open port
    pub channel: Box<dyn LinkChannel>,
    /// The line the device answered with
    pub response: String,
    /// Bytes that arrived after the response line
    pub framer: LineFramer,
}

impl fmt::Debug for ConfirmedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmedPort")
            .field("descriptor", &self.descriptor)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

/// Opens candidates and checks the device identity
#[derive(Clone)]
pub struct HandshakeValidator {
    opener: Arc<dyn PortOpener>,
    settings: HandshakeSettings,
}

impl HandshakeValidator {
    /// Validator opening ports through `opener`
    pub fn new(opener: Arc<dyn PortOpener>, settings: HandshakeSettings) -> Self {
        Self { opener, settings }
    }

    /// Validate a single candidate
    ///
    /// On any failure the port is closed before returning.
    pub fn probe(&self, descriptor: &PortDescriptor) -> Result<ConfirmedPort, LinkError> {
        self.attempt(descriptor, None)
    }

    fn attempt(
        &self,
        descriptor: &PortDescriptor,
        stop: Option<&StopSignal>,
    ) -> Result<ConfirmedPort, LinkError> {
        let mut channel = self.opener.open(descriptor)?;
        let mut framer = LineFramer::new();

        match self.exchange(channel.as_mut(), &mut framer, descriptor, stop) {
            Ok(response) => {
                tracing::debug!(port = %descriptor.path, %response, "handshake accepted");
                Ok(ConfirmedPort {
                    descriptor: descriptor.clone(),
                    channel,
                    response,
                    framer,
                })
            }
            Err(e) => {
                drop(channel);
                Err(e)
            }
        }
    }

    fn exchange(
        &self,
        channel: &mut dyn LinkChannel,
        framer: &mut LineFramer,
        descriptor: &PortDescriptor,
        stop: Option<&StopSignal>,
    ) -> Result<String, LinkError> {
        let stopped = move || stop.is_some_and(StopSignal::is_stopped);

        channel.clear_buffers()?;
        if !self.settings.settle_delay.is_zero() {
            tracing::debug!(
                port = %descriptor.path,
                "waiting {}ms for the device to settle",
                self.settings.settle_delay.as_millis()
            );
            match stop {
                Some(stop) => {
                    if stop.wait_timeout(self.settings.settle_delay) {
                        return Err(LinkError::Stopped);
                    }
                }
                None => thread::sleep(self.settings.settle_delay),
            }
        }
        // Boot banners are not handshake responses
        channel.clear_buffers()?;

        channel.write_all(&[self.settings.probe])?;
        channel.flush()?;

        let response = read_line_within(channel, framer, self.settings.timeout, stopped)?;
        if stopped() {
            return Err(LinkError::Stopped);
        }
        match response {
            Some(line) if line.contains(&self.settings.token) => Ok(line),
            Some(line) => Err(LinkError::HandshakeMismatch {
                port: descriptor.path.clone(),
                response: line,
            }),
            None => Err(LinkError::HandshakeTimeout {
                port: descriptor.path.clone(),
            }),
        }
    }

    /// Try every candidate in order and keep the first that answers
    ///
    /// Blocks for up to the sum of the per-candidate settle delays and timeouts.
    pub fn find_device(&self, enumerator: &dyn PortEnumerator) -> Result<ConfirmedPort, LinkError> {
        self.search(enumerator, None)
    }

    /// Like [`find_device`](Self::find_device), but gives up with
    /// [`LinkError::Stopped`] as soon as `stop` is requested
    ///
    /// The flag is checked before each candidate, during the settle delay and
    /// between reads while waiting for the response.
    pub fn find_device_until(
        &self,
        enumerator: &dyn PortEnumerator,
        stop: &StopSignal,
    ) -> Result<ConfirmedPort, LinkError> {
        self.search(enumerator, Some(stop))
    }

    fn search(
        &self,
        enumerator: &dyn PortEnumerator,
        stop: Option<&StopSignal>,
    ) -> Result<ConfirmedPort, LinkError> {
        let candidates = enumerator.list_candidates();
        if candidates.is_empty() {
            tracing::debug!("no candidate ports");
        }

        for descriptor in &candidates {
            if stop.is_some_and(StopSignal::is_stopped) {
                return Err(LinkError::Stopped);
            }
            match self.attempt(descriptor, stop) {
                Ok(confirmed) => return Ok(confirmed),
                Err(LinkError::Stopped) => return Err(LinkError::Stopped),
                Err(e) => {
                    tracing::warn!(port = %descriptor.path, "candidate rejected: {e}");
                }
            }
        }

        Err(LinkError::NoDeviceFound)
    }
}
