//! Link configuration
//!
//! Every field has a default, so a JSON document only needs the values it
//! overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{FlowControl, LinkError, DEFAULT_BAUD_RATE};

/// Per-instance link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Explicit port to use instead of auto-discovery
    pub port_name: Option<String>,
    /// Line speed in bits per second
    pub baud_rate: u32,
    /// Delay between opening a port and sending the probe
    pub handshake_settle_ms: u64,
    /// Time allowed for the handshake response line
    pub handshake_timeout_ms: u64,
    /// Byte written to ask the device to identify itself
    pub handshake_probe: u8,
    /// Substring identifying the expected device in the handshake response
    pub handshake_token: String,
    /// Maximum unread payload messages held for the consumer
    pub mailbox_capacity: usize,
    /// Pause between reconnection attempts
    pub reconnection_delay_ms: u64,
    /// Bound on each blocking read, and so on stop latency while streaming
    pub read_timeout_ms: u64,
    /// Bound on each blocking write
    pub write_timeout_ms: u64,
    /// Flow control mode
    pub flow_control: FlowControl,
    /// Assert DTR after opening
    pub dtr_enable: bool,
    /// Assert RTS after opening
    pub rts_enable: bool,
    /// Appended to every outbound command
    pub line_terminator: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
            handshake_settle_ms: 2000,
            handshake_timeout_ms: 1000,
            handshake_probe: b'?',
            handshake_token: "READY".to_string(),
            mailbox_capacity: 1,
            reconnection_delay_ms: 1000,
            read_timeout_ms: 100,
            write_timeout_ms: 100,
            flow_control: FlowControl::None,
            dtr_enable: true,
            rts_enable: true,
            line_terminator: "\n".to_string(),
        }
    }
}

impl LinkConfig {
    /// Parse a JSON document, filling omitted fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self, LinkError> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Reject settings the link cannot work with
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.baud_rate == 0 {
            return Err(LinkError::InvalidConfig("baud_rate must be non-zero".into()));
        }
        if self.handshake_token.is_empty() {
            return Err(LinkError::InvalidConfig(
                "handshake_token must not be empty".into(),
            ));
        }
        if self.line_terminator.is_empty() {
            return Err(LinkError::InvalidConfig(
                "line_terminator must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Mailbox capacity, never below one
    pub fn effective_mailbox_capacity(&self) -> usize {
        self.mailbox_capacity.max(1)
    }

    /// Pause between reconnection attempts
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }
}
