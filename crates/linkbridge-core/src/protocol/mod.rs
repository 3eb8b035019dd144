//! Serial link protocol
//!
//! Port discovery, the handshake that confirms the device, and newline
//! framing of the ASCII traffic that follows.

mod error;
pub mod handshake;
pub mod lines;
pub mod serial;
pub mod stream;

pub use error::LinkError;
pub use handshake::{ConfirmedPort, HandshakeSettings, HandshakeValidator};
pub use lines::{read_line, read_line_within, LineFramer};
pub use serial::{
    default_port_filter, list_ports, FixedEnumerator, FlowControl, PortDescriptor,
    PortEnumerator, PortFilter, PortInfo, SerialEnumerator,
};
pub use stream::{LinkChannel, PortOpener, SerialChannel, SerialOpener};

/// Default baud rate for the device link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Longest line accepted before unterminated input is discarded
pub const MAX_LINE_LEN: usize = 8192;
