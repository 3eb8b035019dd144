//! Consumer-facing controller
//!
//! Everything here runs on the consumer's thread. `poll` is meant to be
//! called once per update cycle and never blocks; `connect` is the only call
//! that may block, while it searches for the device.

use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use crate::config::LinkConfig;
use crate::mailbox::{Mailbox, MailboxEntry};
use crate::protocol::{
    FixedEnumerator, HandshakeSettings, HandshakeValidator, LinkError, PortEnumerator,
    PortOpener, SerialEnumerator, SerialOpener,
};
use crate::worker::{LinkWorker, WorkerHandle};

/// Connection state as seen by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device link
    Disconnected,
    /// Device found, waiting for the worker to report it is streaming
    Connecting,
    /// Connected and ready
    Connected,
}

/// What a call to [`Controller::poll`] dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The device is streaming
    Connected,
    /// The device was lost; the worker is reconnecting
    Disconnected,
    /// A line received while connected
    Message(String),
}

/// Callback run before the link is torn down by [`Controller::disconnect`]
pub type TeardownHook = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

type Notify = Box<dyn FnMut() + Send>;
type MessageNotify = Box<dyn FnMut(&str) + Send>;

/// Queues commands on the controller's link while it is connected
///
/// Meant to be captured by a teardown hook so it can say goodbye to the
/// device; queued commands are flushed before the port closes. The handle is
/// bound when [`Controller::poll`] reports `Connected` and unbound when it
/// reports `Disconnected` or the link is torn down. While unbound, sending
/// does nothing.
#[derive(Debug, Clone, Default)]
pub struct OutboundSender {
    target: Arc<Mutex<Weak<Mailbox>>>,
}

impl OutboundSender {
    /// Returns whether the command was queued
    pub fn send(&self, msg: impl Into<String>) -> bool {
        let target = self.target.lock().unwrap_or_else(|e| e.into_inner()).upgrade();
        match target {
            Some(mailbox) => {
                mailbox.push_outbound(msg);
                true
            }
            None => false,
        }
    }

    fn bind(&self, mailbox: &Arc<Mailbox>) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(mailbox);
    }

    fn unbind(&self) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Weak::new();
    }
}

struct ActiveLink {
    worker: WorkerHandle,
    mailbox: Arc<Mailbox>,
    port: String,
}

/// Façade over discovery, the link worker and the mailbox
pub struct Controller {
    config: LinkConfig,
    enumerator: Arc<dyn PortEnumerator>,
    validator: HandshakeValidator,
    state: ConnectionState,
    link: Option<ActiveLink>,
    outbound: OutboundSender,
    teardown_hook: Option<TeardownHook>,
    on_connected: Vec<Notify>,
    on_disconnected: Vec<Notify>,
    on_message: Vec<MessageNotify>,
}

impl Controller {
    /// Controller for real serial ports
    ///
    /// Uses `config.port_name` when set, otherwise scans the machine's ports.
    pub fn new(config: LinkConfig) -> Result<Self, LinkError> {
        let enumerator: Arc<dyn PortEnumerator> = match &config.port_name {
            Some(name) => Arc::new(FixedEnumerator::from_paths([name.clone()], &config)),
            None => Arc::new(SerialEnumerator::new(config.clone())),
        };
        Self::with_transport(config, enumerator, Arc::new(SerialOpener))
    }

    /// Controller with injected discovery and port opening
    pub fn with_transport(
        config: LinkConfig,
        enumerator: Arc<dyn PortEnumerator>,
        opener: Arc<dyn PortOpener>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let validator = HandshakeValidator::new(opener, HandshakeSettings::from_config(&config));
        Ok(Self {
            config,
            enumerator,
            validator,
            state: ConnectionState::Disconnected,
            link: None,
            outbound: OutboundSender::default(),
            teardown_hook: None,
            on_connected: Vec::new(),
            on_disconnected: Vec::new(),
            on_message: Vec::new(),
        })
    }

    /// Connection state as of the last dispatched sentinel
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the consumer has seen `Connected` and no loss since
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether a worker is running, including while it is reconnecting
    pub fn is_active(&self) -> bool {
        self.link.is_some()
    }

    /// Port the current link was established on
    pub fn port_name(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.port.as_str())
    }

    /// Payloads dropped on the current link because the consumer fell behind
    pub fn dropped_messages(&self) -> u64 {
        self.link.as_ref().map_or(0, |l| l.mailbox.dropped())
    }

    /// Find the device and start the link worker
    ///
    /// Blocks until a candidate passes the handshake or all have failed. Does
    /// nothing while a link is already active.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        if self.link.is_some() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let confirmed = match self.validator.find_device(self.enumerator.as_ref()) {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let port = confirmed.descriptor.path.clone();
        let mailbox = Arc::new(Mailbox::new(self.config.effective_mailbox_capacity()));
        let worker = LinkWorker::new(
            self.validator.clone(),
            Arc::clone(&self.enumerator),
            Arc::clone(&mailbox),
            &self.config,
        );
        let worker = match worker.spawn(Some(confirmed)) {
            Ok(handle) => handle,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        tracing::info!(%port, "link worker started");
        self.link = Some(ActiveLink {
            worker,
            mailbox,
            port,
        });
        Ok(())
    }

    /// Dispatch at most one pending entry
    ///
    /// Messages arriving while not connected are discarded and yield `None`.
    pub fn poll(&mut self) -> Option<LinkEvent> {
        let entry = self.link.as_ref()?.mailbox.pop()?;
        self.dispatch(entry)
    }

    fn dispatch(&mut self, entry: MailboxEntry) -> Option<LinkEvent> {
        match entry {
            MailboxEntry::Connected => {
                self.state = ConnectionState::Connected;
                if let Some(link) = &self.link {
                    self.outbound.bind(&link.mailbox);
                }
                for notify in self.on_connected.iter_mut() {
                    notify();
                }
                Some(LinkEvent::Connected)
            }
            MailboxEntry::Disconnected => {
                self.state = ConnectionState::Disconnected;
                self.outbound.unbind();
                for notify in self.on_disconnected.iter_mut() {
                    notify();
                }
                Some(LinkEvent::Disconnected)
            }
            MailboxEntry::Payload(msg) => {
                if self.state != ConnectionState::Connected {
                    tracing::trace!(%msg, "discarding message received while not connected");
                    return None;
                }
                for notify in self.on_message.iter_mut() {
                    notify(&msg);
                }
                Some(LinkEvent::Message(msg))
            }
        }
    }

    /// Queue a line for the device; ignored unless connected
    pub fn send(&self, msg: impl Into<String>) {
        if !self.is_connected() {
            return;
        }
        if let Some(link) = &self.link {
            link.mailbox.push_outbound(msg);
        }
    }

    /// Sender that follows this controller's link across reconnects and restarts
    pub fn outbound_sender(&self) -> OutboundSender {
        self.outbound.clone()
    }

    /// Replace the teardown hook
    pub fn set_teardown_hook<F>(&mut self, hook: F)
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.teardown_hook = Some(Box::new(hook));
    }

    /// Register a callback for when the device becomes connected
    pub fn on_connected<F>(&mut self, notify: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_connected.push(Box::new(notify));
    }

    /// Register a callback for when the device is lost
    pub fn on_disconnected<F>(&mut self, notify: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_disconnected.push(Box::new(notify));
    }

    /// Register a callback for each line received while connected
    pub fn on_message<F>(&mut self, notify: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_message.push(Box::new(notify));
    }

    /// Run the teardown hook, stop the worker and wait for it to exit
    ///
    /// Returns once the port is closed. Does nothing without an active link.
    pub fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        // The hook can still queue farewell commands through an OutboundSender
        self.run_teardown_hook();
        self.outbound.unbind();

        link.worker.stop_and_join();
        self.state = ConnectionState::Disconnected;
        tracing::info!(port = %link.port, "disconnected");
    }

    fn run_teardown_hook(&mut self) {
        let Some(hook) = self.teardown_hook.as_mut() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| hook())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("teardown hook failed: {e:#}"),
            Err(_) => tracing::warn!("teardown hook panicked"),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.disconnect();
    }
}
