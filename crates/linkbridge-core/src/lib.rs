//! # linkbridge Core Library
//!
//! Bridges a line-oriented serial device and a consumer loop that must never
//! block on I/O.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port discovery with a pluggable candidate filter
//! - Handshake-based device validation
//! - A background link worker that reconnects after the device drops out
//! - A bounded, lossy mailbox between the worker and the consumer
//! - A polling controller with connect/disconnect notifications
//!
//! ## Example
//!
//! ```rust,ignore
//! use linkbridge_core::prelude::*;
//!
//! let mut link = Controller::new(LinkConfig::default())?;
//! link.on_message(|line| println!("device says {line}"));
//! link.connect()?;
//!
//! // once per frame
//! link.poll();
//! link.send("led on");
//! ```

pub mod config;
pub mod controller;
pub mod mailbox;
#[cfg(any(test, feature = "mock"))]
#[cfg_attr(docsrs, doc(cfg(feature = "mock")))]
pub mod mock;
pub mod protocol;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::LinkConfig;
    pub use crate::controller::{ConnectionState, Controller, LinkEvent, OutboundSender};
    pub use crate::mailbox::{Mailbox, MailboxEntry, Sentinel};
    pub use crate::protocol::{
        FixedEnumerator, HandshakeValidator, LinkError, PortDescriptor, PortEnumerator,
        PortOpener, SerialEnumerator, SerialOpener,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
