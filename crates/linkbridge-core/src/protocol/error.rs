//! Link errors

use thiserror::Error;

/// Errors that can occur while discovering, validating or talking to a device
#[derive(Error, Debug)]
pub enum LinkError {
    /// Every candidate failed, or there were none
    #[error("No device answered the handshake")]
    NoDeviceFound,

    /// The device did not answer the probe in time
    #[error("Handshake timed out on {port}")]
    HandshakeTimeout {
        /// Candidate that stayed silent
        port: String,
    },

    /// The device answered with a line lacking the token
    #[error("Handshake mismatch on {port}: got '{response}'")]
    HandshakeMismatch {
        /// Candidate that answered
        port: String,
        /// What it answered with
        response: String,
    },

    /// The port could not be opened or configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file is not valid JSON
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A stop was requested while searching for the device
    #[error("Device search stopped")]
    Stopped,

    /// Reading from or writing to the port failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
