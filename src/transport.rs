//! In-process point-to-point substrate.
//!
//! Every simulated process owns a [`Mailbox`]. Sends are eager: the payload is
//! copied into the destination mailbox immediately. Receives scan the mailbox
//! in arrival order, so delivery is FIFO for any fixed
//! (source, context, tag) channel and unordered across channels.

use crate::error::{Error, Result};
use crate::group::ProcessId;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Isolation context separating one communicator's traffic from another's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ContextId(pub(crate) u32);

impl ContextId {
    /// The context carrying collective traffic for a communicator whose
    /// point-to-point context is `self`.
    pub(crate) fn collective(self) -> ContextId {
        ContextId(self.0 + 1)
    }
}

/// A message in flight.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) source: ProcessId,
    pub(crate) context: ContextId,
    pub(crate) tag: i32,
    pub(crate) payload: Vec<u8>,
}

/// Selects which envelopes a receive or probe accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Matcher {
    pub(crate) context: ContextId,
    /// `None` accepts any source.
    pub(crate) source: Option<ProcessId>,
    /// `None` accepts any tag.
    pub(crate) tag: Option<i32>,
}

impl Matcher {
    pub(crate) fn accepts(&self, envelope: &Envelope) -> bool {
        envelope.context == self.context
            && self.source.map_or(true, |s| s == envelope.source)
            && self.tag.map_or(true, |t| t == envelope.tag)
    }
}

#[derive(Debug, Default)]
pub(crate) struct MailboxState {
    pub(crate) queue: VecDeque<Envelope>,
    /// Set once the universe aborts; wakes and fails every waiter.
    pub(crate) aborted: Option<i32>,
}

impl MailboxState {
    /// Remove and return the first envelope accepted by `matcher`.
    pub(crate) fn take(&mut self, matcher: &Matcher) -> Option<Envelope> {
        let idx = self.queue.iter().position(|e| matcher.accepts(e))?;
        self.queue.remove(idx)
    }

    /// Look at the first envelope accepted by `matcher` without removing it.
    pub(crate) fn peek(&self, matcher: &Matcher) -> Option<&Envelope> {
        self.queue.iter().find(|e| matcher.accepts(e))
    }
}

/// Per-process incoming message queue.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, envelope: Envelope) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.aborted {
            return Err(Error::Aborted(code));
        }
        state.queue.push_back(envelope);
        self.arrived.notify_all();
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock()
    }

    /// Block until another envelope arrives or the mailbox is closed.
    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, MailboxState>) {
        self.arrived.wait(guard);
    }

    fn close(&self, code: i32) {
        let mut state = self.state.lock();
        state.aborted.get_or_insert(code);
        self.arrived.notify_all();
    }

    /// Drop every queued envelope on one of `contexts`, returning how many.
    pub(crate) fn purge(&self, contexts: &[ContextId]) -> usize {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|e| !contexts.contains(&e.context));
        before - state.queue.len()
    }
}

/// Directory of every mailbox in a universe.
#[derive(Debug, Default)]
pub(crate) struct Transport {
    mailboxes: RwLock<HashMap<ProcessId, Arc<Mailbox>>>,
    closed: Mutex<Option<i32>>,
}

impl Transport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create the mailbox for a new process.
    pub(crate) fn register(&self, pid: ProcessId) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new());
        self.mailboxes.write().insert(pid, Arc::clone(&mailbox));
        mailbox
    }

    /// Remove the mailbox of a process that has exited. Queued envelopes are
    /// dropped with it and later sends to `pid` fail.
    pub(crate) fn unregister(&self, pid: ProcessId) {
        if let Some(mailbox) = self.mailboxes.write().remove(&pid) {
            let dropped = mailbox.state.lock().queue.len();
            if dropped > 0 {
                tracing::debug!(process = %pid, dropped, "dropped unreceived messages");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.mailboxes.read().len()
    }

    /// Deliver a message to `dest`.
    pub(crate) fn send(&self, dest: ProcessId, envelope: Envelope) -> Result<()> {
        if let Some(code) = *self.closed.lock() {
            return Err(Error::Aborted(code));
        }
        let mailbox = self
            .mailboxes
            .read()
            .get(&dest)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("process {dest} is not running")))?;
        tracing::trace!(
            source = %envelope.source,
            dest = %dest,
            context = envelope.context.0,
            tag = envelope.tag,
            bytes = envelope.payload.len(),
            "deliver"
        );
        mailbox.deliver(envelope)
    }

    /// Close every mailbox, waking all blocked receivers with `Aborted`.
    pub(crate) fn close_all(&self, code: i32) {
        self.closed.lock().get_or_insert(code);
        for mailbox in self.mailboxes.read().values() {
            mailbox.close(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(source: u64, context: u32, tag: i32, byte: u8) -> Envelope {
        Envelope {
            source: ProcessId(source),
            context: ContextId(context),
            tag,
            payload: vec![byte],
        }
    }

    #[test]
    fn matcher_wildcards() {
        let e = envelope(3, 10, 5, 0);
        let exact = Matcher {
            context: ContextId(10),
            source: Some(ProcessId(3)),
            tag: Some(5),
        };
        assert!(exact.accepts(&e));
        let any = Matcher {
            context: ContextId(10),
            source: None,
            tag: None,
        };
        assert!(any.accepts(&e));
        let other_context = Matcher {
            context: ContextId(12),
            ..any
        };
        assert!(!other_context.accepts(&e));
        let other_tag = Matcher {
            tag: Some(6),
            ..exact
        };
        assert!(!other_tag.accepts(&e));
    }

    #[test]
    fn fifo_per_channel_and_skip_other_channels() {
        let transport = Transport::new();
        let mailbox = transport.register(ProcessId(1));
        transport.send(ProcessId(1), envelope(0, 4, 1, 1)).unwrap();
        transport.send(ProcessId(1), envelope(0, 4, 2, 2)).unwrap();
        transport.send(ProcessId(1), envelope(0, 4, 1, 3)).unwrap();

        let tag1 = Matcher {
            context: ContextId(4),
            source: Some(ProcessId(0)),
            tag: Some(1),
        };
        let mut state = mailbox.lock();
        assert_eq!(state.take(&tag1).unwrap().payload, vec![1]);
        assert_eq!(state.take(&tag1).unwrap().payload, vec![3]);
        assert!(state.take(&tag1).is_none());
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn send_to_unknown_process_fails() {
        let transport = Transport::new();
        let err = transport
            .send(ProcessId(42), envelope(0, 0, 0, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn unregistered_process_no_longer_receives() {
        let transport = Transport::new();
        transport.register(ProcessId(5));
        transport.send(ProcessId(5), envelope(0, 0, 0, 1)).unwrap();
        assert_eq!(transport.len(), 1);
        transport.unregister(ProcessId(5));
        assert_eq!(transport.len(), 0);
        let err = transport.send(ProcessId(5), envelope(0, 0, 0, 2)).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        // A second removal is harmless.
        transport.unregister(ProcessId(5));
    }

    #[test]
    fn close_rejects_further_delivery() {
        let transport = Transport::new();
        let mailbox = transport.register(ProcessId(7));
        transport.close_all(3);
        assert_eq!(mailbox.lock().aborted, Some(3));
        let err = transport.send(ProcessId(7), envelope(0, 0, 0, 0)).unwrap_err();
        assert_eq!(err, Error::Aborted(3));
    }

    #[test]
    fn purge_only_named_contexts() {
        let transport = Transport::new();
        let mailbox = transport.register(ProcessId(2));
        transport.send(ProcessId(2), envelope(0, 4, 0, 0)).unwrap();
        transport.send(ProcessId(2), envelope(0, 5, 0, 0)).unwrap();
        transport.send(ProcessId(2), envelope(0, 6, 0, 0)).unwrap();
        assert_eq!(mailbox.purge(&[ContextId(4), ContextId(5)]), 2);
        assert_eq!(mailbox.lock().queue.len(), 1);
    }
}
