//! Message mailbox
//!
//! The only state shared between the link worker and the consumer. Inbound
//! entries form one FIFO in which payloads are bounded and sentinels are
//! not; outbound commands have their own unbounded FIFO.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// One inbound entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEntry {
    /// The worker confirmed a device and started streaming
    Connected,
    /// The worker lost the device
    Disconnected,
    /// A line received from the device
    Payload(String),
}

/// Connection-state signal pushed by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// See [`MailboxEntry::Connected`]
    Connected,
    /// See [`MailboxEntry::Disconnected`]
    Disconnected,
}

impl From<Sentinel> for MailboxEntry {
    fn from(sentinel: Sentinel) -> Self {
        match sentinel {
            Sentinel::Connected => MailboxEntry::Connected,
            Sentinel::Disconnected => MailboxEntry::Disconnected,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    inbound: VecDeque<MailboxEntry>,
    payloads: usize,
    dropped: u64,
    outbound: VecDeque<String>,
}

/// Bounded, lossy inbound queue plus an outbound command queue
///
/// When `capacity` unread payloads are waiting, further payloads are
/// discarded; the oldest unread ones survive. Sentinels always get through.
#[derive(Debug)]
pub struct Mailbox {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Mailbox {
    /// Create a mailbox holding at most `capacity` unread payloads (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation is a single push or pop, so a poisoned lock still holds consistent data
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Payload capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue a payload; returns `false` if it was dropped because the mailbox is full
    pub fn push_payload(&self, msg: impl Into<String>) -> bool {
        let mut inner = self.lock();
        if inner.payloads >= self.capacity {
            inner.dropped += 1;
            return false;
        }
        inner.payloads += 1;
        inner.inbound.push_back(MailboxEntry::Payload(msg.into()));
        true
    }

    /// Queue a connection-state sentinel; never dropped
    pub fn push_sentinel(&self, sentinel: Sentinel) {
        self.lock().inbound.push_back(sentinel.into());
    }

    /// Take the oldest inbound entry without blocking
    pub fn pop(&self) -> Option<MailboxEntry> {
        let mut inner = self.lock();
        let entry = inner.inbound.pop_front()?;
        if matches!(entry, MailboxEntry::Payload(_)) {
            inner.payloads -= 1;
        }
        Some(entry)
    }

    /// Queue a command for the device
    ///
    /// Unbounded: callers should stop sending while the link is down.
    pub fn push_outbound(&self, cmd: impl Into<String>) {
        self.lock().outbound.push_back(cmd.into());
    }

    /// Take the oldest queued command
    pub fn pop_outbound(&self) -> Option<String> {
        self.lock().outbound.pop_front()
    }

    /// Take every queued command at once
    pub fn drain_outbound(&self) -> Vec<String> {
        self.lock().outbound.drain(..).collect()
    }

    /// Inbound entries waiting, sentinels included
    pub fn len(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Whether no inbound entry is pending
    pub fn is_empty(&self) -> bool {
        self.lock().inbound.is_empty()
    }

    /// Unread payload entries
    pub fn payload_len(&self) -> usize {
        self.lock().payloads
    }

    /// Queued outbound commands
    pub fn outbound_len(&self) -> usize {
        self.lock().outbound.len()
    }

    /// Payloads discarded so far because the mailbox was full
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    fn payload(s: &str) -> Option<MailboxEntry> {
        Some(MailboxEntry::Payload(s.to_string()))
    }

    #[test]
    fn test_overflow_drops_newest() {
        let mailbox = Mailbox::new(1);
        assert!(mailbox.push_payload("x1"));
        assert!(!mailbox.push_payload("x2"));
        assert!(!mailbox.push_payload("x3"));

        assert_eq!(mailbox.pop(), payload("x1"));
        assert_eq!(mailbox.pop(), None);
        assert_eq!(mailbox.dropped(), 2);
    }

    #[test]
    fn test_capacity_frees_after_pop() {
        let mailbox = Mailbox::new(1);
        mailbox.push_payload("a");
        assert_eq!(mailbox.pop(), payload("a"));
        assert!(mailbox.push_payload("b"));
        assert_eq!(mailbox.pop(), payload("b"));
    }

    #[test]
    fn test_holds_exactly_capacity_oldest_first() {
        for capacity in 1..=5 {
            let mailbox = Mailbox::new(capacity);
            for i in 0..capacity * 3 {
                mailbox.push_payload(format!("m{i}"));
            }
            assert_eq!(mailbox.payload_len(), capacity);
            for i in 0..capacity {
                assert_eq!(mailbox.pop(), payload(&format!("m{i}")));
            }
            assert!(mailbox.is_empty());
        }
    }

    #[test]
    fn test_sentinels_bypass_capacity() {
        let mailbox = Mailbox::new(1);
        mailbox.push_sentinel(Sentinel::Connected);
        mailbox.push_payload("first");
        mailbox.push_payload("dropped");
        mailbox.push_sentinel(Sentinel::Disconnected);
        mailbox.push_sentinel(Sentinel::Connected);

        assert_eq!(mailbox.len(), 4);
        assert_eq!(mailbox.pop(), Some(MailboxEntry::Connected));
        assert_eq!(mailbox.pop(), payload("first"));
        assert_eq!(mailbox.pop(), Some(MailboxEntry::Disconnected));
        assert_eq!(mailbox.pop(), Some(MailboxEntry::Connected));
        assert_eq!(mailbox.pop(), None);
    }

    #[test]
    fn test_zero_capacity_treated_as_one() {
        let mailbox = Mailbox::new(0);
        assert_eq!(mailbox.capacity(), 1);
        assert!(mailbox.push_payload("only"));
    }

    #[test]
    fn test_outbound_fifo() {
        let mailbox = Mailbox::default();
        mailbox.push_outbound("a");
        mailbox.push_outbound("b");
        mailbox.push_outbound("c");
        assert_eq!(mailbox.outbound_len(), 3);
        assert_eq!(mailbox.pop_outbound().as_deref(), Some("a"));
        assert_eq!(mailbox.drain_outbound(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(mailbox.pop_outbound(), None);
    }

    #[test]
    fn test_sentinels_survive_concurrent_flood() {
        let mailbox = Arc::new(Mailbox::new(2));
        let producer = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || {
                for i in 0..1000 {
                    mailbox.push_payload(format!("p{i}"));
                    if i % 100 == 0 {
                        mailbox.push_sentinel(Sentinel::Disconnected);
                        mailbox.push_sentinel(Sentinel::Connected);
                    }
                }
            })
        };

        let mut sentinels = 0;
        let mut payloads = 0;
        while !producer.is_finished() || !mailbox.is_empty() {
            match mailbox.pop() {
                Some(MailboxEntry::Payload(_)) => payloads += 1,
                Some(_) => sentinels += 1,
                None => thread::yield_now(),
            }
            assert!(mailbox.payload_len() <= 2);
        }
        producer.join().unwrap();
        while let Some(entry) = mailbox.pop() {
            match entry {
                MailboxEntry::Payload(_) => payloads += 1,
                _ => sentinels += 1,
            }
        }

        assert_eq!(sentinels, 20);
        assert_eq!(payloads as u64 + mailbox.dropped(), 1000);
    }
}
