//! Link worker
//!
//! Owns the confirmed port on a dedicated thread. Reads lines into the
//! mailbox, writes queued commands out, and on any I/O failure closes the
//! port and keeps re-validating until it finds the device again or is asked
//! to stop.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Reconnecting -> Streaming ...
//!                 \            \            \
//!                  +------------+------------+--> Stopped
//! ```

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::LinkConfig;
use crate::mailbox::{Mailbox, Sentinel};
use crate::protocol::{
    read_line, ConfirmedPort, HandshakeValidator, LinkChannel, LinkError, PortEnumerator,
};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, not yet started
    Idle,
    /// Looking for the device for the first time
    Connecting,
    /// Port open, exchanging lines
    Streaming,
    /// Lost the device, retrying
    Reconnecting,
    /// Terminal
    Stopped,
}

/// Cooperative cancellation shared by the controller and its worker
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// A signal that has not been raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter
    pub fn request_stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    /// Whether a stop has been requested
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` unless a stop arrives first; returns whether stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

enum StreamEnd {
    Stopped,
    Failed(io::Error),
}

/// Background I/O loop for one controller
pub struct LinkWorker {
    validator: HandshakeValidator,
    enumerator: Arc<dyn PortEnumerator>,
    mailbox: Arc<Mailbox>,
    stop: StopSignal,
    reconnection_delay: Duration,
    line_terminator: String,
    state: WorkerState,
}

impl LinkWorker {
    /// Worker publishing into `mailbox`, rediscovering through `enumerator`
    pub fn new(
        validator: HandshakeValidator,
        enumerator: Arc<dyn PortEnumerator>,
        mailbox: Arc<Mailbox>,
        config: &LinkConfig,
    ) -> Self {
        Self {
            validator,
            enumerator,
            mailbox,
            stop: StopSignal::new(),
            reconnection_delay: config.reconnection_delay(),
            line_terminator: config.line_terminator.clone(),
            state: WorkerState::Idle,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Handle that can stop this worker once it runs
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Start the worker thread
    ///
    /// With `initial` the worker streams on that port right away; otherwise it
    /// starts by searching for the device.
    pub fn spawn(self, initial: Option<ConfirmedPort>) -> Result<WorkerHandle, LinkError> {
        let stop = self.stop.clone();
        let thread = thread::Builder::new()
            .name("linkbridge-worker".to_string())
            .spawn(move || self.run(initial))?;
        Ok(WorkerHandle { thread, stop })
    }

    /// Run the state machine on the current thread until stopped
    pub fn run(mut self, initial: Option<ConfirmedPort>) {
        let mut pending = initial;
        self.set_state(WorkerState::Connecting);

        loop {
            let confirmed = match pending.take() {
                Some(confirmed) => confirmed,
                None => match self.acquire() {
                    Some(confirmed) => confirmed,
                    None => break,
                },
            };

            tracing::info!(port = %confirmed.descriptor.path, "device connected");
            self.mailbox.push_sentinel(Sentinel::Connected);
            self.set_state(WorkerState::Streaming);

            match self.stream(confirmed) {
                StreamEnd::Stopped => break,
                StreamEnd::Failed(e) => {
                    tracing::warn!("link failed: {e}");
                    self.mailbox.push_sentinel(Sentinel::Disconnected);
                    self.discard_outbound();
                    self.set_state(WorkerState::Reconnecting);
                    if self.stop.wait_timeout(self.reconnection_delay) {
                        break;
                    }
                }
            }
        }

        self.set_state(WorkerState::Stopped);
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            tracing::debug!("worker {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Re-run discovery until a device answers or a stop is requested
    fn acquire(&mut self) -> Option<ConfirmedPort> {
        loop {
            if self.stop.is_stopped() {
                return None;
            }
            match self
                .validator
                .find_device_until(self.enumerator.as_ref(), &self.stop)
            {
                Ok(confirmed) => {
                    if self.stop.is_stopped() {
                        return None;
                    }
                    self.discard_outbound();
                    return Some(confirmed);
                }
                Err(LinkError::Stopped) => return None,
                Err(e) => {
                    tracing::debug!(
                        "{e}; retrying in {}ms",
                        self.reconnection_delay.as_millis()
                    );
                    if self.stop.wait_timeout(self.reconnection_delay) {
                        return None;
                    }
                }
            }
        }
    }

    /// Exchange lines until the link fails or a stop is requested; the port closes on return
    fn stream(&mut self, confirmed: ConfirmedPort) -> StreamEnd {
        let ConfirmedPort {
            descriptor,
            mut channel,
            mut framer,
            ..
        } = confirmed;

        if let Err(e) = channel.set_read_timeout(descriptor.read_timeout) {
            return StreamEnd::Failed(e);
        }

        loop {
            if self.stop.is_stopped() {
                self.flush_outbound(channel.as_mut());
                tracing::info!(port = %descriptor.path, "closing port");
                return StreamEnd::Stopped;
            }

            if let Some(cmd) = self.mailbox.pop_outbound() {
                if let Err(e) = self.write_command(channel.as_mut(), &cmd) {
                    return StreamEnd::Failed(e);
                }
            }

            match read_line(channel.as_mut(), &mut framer) {
                Ok(Some(line)) => {
                    tracing::trace!(%line, "received");
                    if !self.mailbox.push_payload(line) {
                        tracing::trace!("mailbox full, line dropped");
                    }
                }
                Ok(None) => {}
                Err(e) => return StreamEnd::Failed(e),
            }
        }
    }

    fn write_command(&self, channel: &mut dyn LinkChannel, cmd: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(cmd.len() + self.line_terminator.len());
        bytes.extend_from_slice(cmd.as_bytes());
        bytes.extend_from_slice(self.line_terminator.as_bytes());
        channel.write_all(&bytes)?;
        channel.flush()
    }

    /// Commands queued for a link that went away are never replayed to the next one
    fn discard_outbound(&self) {
        let stale = self.mailbox.drain_outbound();
        if !stale.is_empty() {
            tracing::debug!("discarding {} commands queued for a lost link", stale.len());
        }
    }

    /// Best-effort write of whatever is still queued, e.g. by a teardown hook
    fn flush_outbound(&self, channel: &mut dyn LinkChannel) {
        for cmd in self.mailbox.drain_outbound() {
            if let Err(e) = self.write_command(channel, &cmd) {
                tracing::debug!("dropping queued command on shutdown: {e}");
                break;
            }
        }
    }
}

/// A running worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    thread: JoinHandle<()>,
    stop: StopSignal,
}

impl WorkerHandle {
    /// Stop the worker and wait for its thread to exit
    pub fn stop_and_join(self) {
        self.stop.request_stop();
        if self.thread.join().is_err() {
            tracing::error!("link worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailboxEntry;
    use crate::mock::{MockDevice, MockOpener};
    use crate::protocol::{FixedEnumerator, HandshakeSettings};
    use std::time::Instant;

    fn test_config() -> LinkConfig {
        LinkConfig {
            handshake_settle_ms: 0,
            handshake_timeout_ms: 50,
            reconnection_delay_ms: 20,
            read_timeout_ms: 2,
            ..LinkConfig::default()
        }
    }

    fn worker_for(device: &MockDevice, mailbox: Arc<Mailbox>) -> LinkWorker {
        worker_over(&[("/dev/ttyACM0", device.clone())], mailbox, test_config())
    }

    fn worker_over(
        ports: &[(&str, MockDevice)],
        mailbox: Arc<Mailbox>,
        config: LinkConfig,
    ) -> LinkWorker {
        let opener = MockOpener::new();
        for (path, device) in ports {
            opener.attach(*path, device.clone());
        }
        let validator =
            HandshakeValidator::new(Arc::new(opener), HandshakeSettings::from_config(&config));
        let enumerator = Arc::new(FixedEnumerator::from_paths(
            ports.iter().map(|(p, _)| *p),
            &config,
        ));
        LinkWorker::new(validator, enumerator, mailbox, &config)
    }

    fn next_entry(mailbox: &Mailbox) -> MailboxEntry {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(entry) = mailbox.pop() {
                return entry;
            }
            assert!(Instant::now() < deadline, "timed out waiting for mailbox entry");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            thread::spawn(move || stop.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(10));
        stop.request_stop();
        assert!(waiter.join().unwrap());
        assert!(stop.is_stopped());
    }

    #[test]
    fn test_wait_without_stop_times_out() {
        let stop = StopSignal::new();
        assert!(!stop.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_new_worker_is_idle() {
        let mailbox = Arc::new(Mailbox::new(1));
        let worker = worker_for(&MockDevice::responding("READY"), mailbox);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn test_connects_then_streams_lines() {
        let device = MockDevice::responding("READY");
        let mailbox = Arc::new(Mailbox::new(4));
        let handle = worker_for(&device, Arc::clone(&mailbox)).spawn(None).unwrap();

        assert_eq!(next_entry(&mailbox), MailboxEntry::Connected);
        device.emit("hello");
        assert_eq!(next_entry(&mailbox), MailboxEntry::Payload("hello".into()));

        handle.stop_and_join();
        assert!(!device.is_open());
    }

    #[test]
    fn test_writes_outbound_with_terminator() {
        let device = MockDevice::responding("READY");
        let mailbox = Arc::new(Mailbox::new(1));
        let handle = worker_for(&device, Arc::clone(&mailbox)).spawn(None).unwrap();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Connected);

        mailbox.push_outbound("led 1");
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.sent_lines().is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(device.sent_lines(), vec!["led 1".to_string()]);
        handle.stop_and_join();
    }

    #[test]
    fn test_failure_emits_single_disconnect_then_reconnects() {
        let device = MockDevice::responding("READY");
        let mailbox = Arc::new(Mailbox::new(1));
        let handle = worker_for(&device, Arc::clone(&mailbox)).spawn(None).unwrap();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Connected);

        device.unplug();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Disconnected);

        // Several failed attempts while unplugged must not add sentinels
        thread::sleep(Duration::from_millis(100));
        assert!(mailbox.is_empty());

        device.replug();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Connected);
        handle.stop_and_join();
    }

    #[test]
    fn test_stop_while_searching() {
        let device = MockDevice::silent();
        let mailbox = Arc::new(Mailbox::new(1));
        let handle = worker_for(&device, Arc::clone(&mailbox)).spawn(None).unwrap();

        thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        handle.stop_and_join();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_stop_interrupts_reconnect_search() {
        let device = MockDevice::responding("READY");
        let ports = [
            ("A", device.clone()),
            ("B", MockDevice::silent()),
            ("C", MockDevice::silent()),
            ("D", MockDevice::silent()),
        ];
        let config = LinkConfig {
            handshake_settle_ms: 300,
            handshake_timeout_ms: 100,
            ..test_config()
        };
        let mailbox = Arc::new(Mailbox::new(1));
        let handle = worker_over(&ports, Arc::clone(&mailbox), config)
            .spawn(None)
            .unwrap();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Connected);

        device.unplug();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Disconnected);
        // Past the reconnection delay, into the settle delay of a silent candidate
        thread::sleep(Duration::from_millis(60));

        let started = Instant::now();
        handle.stop_and_join();
        assert!(
            started.elapsed() < Duration::from_millis(250),
            "stop took {:?}",
            started.elapsed()
        );
        for (_, candidate) in &ports {
            assert!(!candidate.is_open());
        }
    }

    #[test]
    fn test_commands_queued_for_lost_link_are_discarded() {
        let device = MockDevice::responding("READY");
        let mailbox = Arc::new(Mailbox::new(1));
        let handle = worker_for(&device, Arc::clone(&mailbox)).spawn(None).unwrap();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Connected);

        device.unplug();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Disconnected);
        mailbox.push_outbound("stale");

        device.replug();
        assert_eq!(next_entry(&mailbox), MailboxEntry::Connected);
        assert_eq!(mailbox.outbound_len(), 0);

        mailbox.push_outbound("fresh");
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.sent_lines().is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(device.sent_lines(), vec!["fresh".to_string()]);
        handle.stop_and_join();
    }

    #[test]
    fn test_stop_flushes_queued_commands() {
        let device = MockDevice::responding("READY");
        let mailbox = Arc::new(Mailbox::new(1));
        let worker = worker_for(&device, Arc::clone(&mailbox));
        let stop = worker.stop_signal();

        // Stop before the first iteration: every queued command goes out in one flush
        mailbox.push_outbound("a");
        mailbox.push_outbound("bye");
        let validator = worker.validator.clone();
        let confirmed = validator
            .find_device(worker.enumerator.as_ref())
            .unwrap();
        stop.request_stop();
        worker.run(Some(confirmed));

        assert_eq!(device.sent_lines(), vec!["a".to_string(), "bye".to_string()]);
        assert_eq!(mailbox.pop(), Some(MailboxEntry::Connected));
        assert!(!device.is_open());
    }
}
