//! Per-process runtime context.
//!
//! [`ProcessState`] is owned by exactly one simulated process (one thread).
//! It holds the communicator arena, the operator table and the queue of
//! posted receives, and drives matching against the process mailbox.
//!
//! Receives match in posting order: a blocking receive is a posted receive
//! that is waited on at once, so an earlier nonblocking receive always gets
//! first pick of an incoming message.

use crate::comm::{CommKind, CommRecord, CommTable};
use crate::error::{Error, ErrorMode, Result};
use crate::group::{Group, ProcessId};
use crate::info::Info;
use crate::op::OpTable;
use crate::transport::{ContextId, Envelope, Mailbox, MailboxState, Matcher};
use crate::universe::UniverseInner;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

/// Everything a new process needs, built by the launching thread.
pub(crate) struct ProcessSeed {
    pub(crate) pid: ProcessId,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) world: Group,
    pub(crate) world_context: ContextId,
    pub(crate) self_context: ContextId,
    pub(crate) parent: Option<(Group, ContextId)>,
    pub(crate) launch: LaunchInfo,
}

/// How a process was started.
#[derive(Debug, Clone, Default)]
pub(crate) struct LaunchInfo {
    pub(crate) command: Option<String>,
    pub(crate) args: Vec<String>,
    pub(crate) info: Info,
}

/// A receive that has been posted but not necessarily matched yet.
#[derive(Debug)]
pub(crate) struct Posted {
    pub(crate) matcher: Matcher,
    slot: RefCell<Option<Envelope>>,
}

impl Posted {
    pub(crate) fn is_complete(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub(crate) fn take(&self) -> Option<Envelope> {
        self.slot.borrow_mut().take()
    }
}

pub(crate) struct ProcessState {
    pub(crate) universe: Arc<UniverseInner>,
    pub(crate) pid: ProcessId,
    mailbox: Arc<Mailbox>,
    pub(crate) comms: RefCell<CommTable>,
    /// Handles dropped while the table was borrowed.
    pub(crate) deferred_releases: RefCell<Vec<i32>>,
    pub(crate) ops: RefCell<OpTable>,
    posted: RefCell<Vec<Rc<Posted>>>,
    pub(crate) world: i32,
    pub(crate) self_comm: i32,
    pub(crate) parent: Option<i32>,
    pub(crate) launch: LaunchInfo,
    pub(crate) started: Instant,
    finalized: Cell<bool>,
}

impl ProcessState {
    pub(crate) fn from_seed(universe: Arc<UniverseInner>, seed: ProcessSeed) -> Rc<Self> {
        let errors = universe.config.default_errors;
        let mut comms = CommTable::default();
        let world_group = seed.world.clone();
        let world = comms.insert(CommRecord::new(
            seed.world,
            None,
            seed.world_context,
            seed.pid,
            CommKind::World,
            "MPI_COMM_WORLD".to_string(),
            errors,
        ));
        let self_comm = comms.insert(CommRecord::new(
            Group::from_members(vec![seed.pid]),
            None,
            seed.self_context,
            seed.pid,
            CommKind::SelfComm,
            "MPI_COMM_SELF".to_string(),
            errors,
        ));
        let parent = seed.parent.map(|(remote, context)| {
            comms.insert(CommRecord::new(
                world_group,
                Some(remote),
                context,
                seed.pid,
                CommKind::Parent,
                "MPI_COMM_PARENT".to_string(),
                errors,
            ))
        });
        Rc::new(ProcessState {
            universe,
            pid: seed.pid,
            mailbox: seed.mailbox,
            comms: RefCell::new(comms),
            deferred_releases: RefCell::new(Vec::new()),
            ops: RefCell::new(OpTable::new()),
            posted: RefCell::new(Vec::new()),
            world,
            self_comm,
            parent,
            launch: seed.launch,
            started: Instant::now(),
            finalized: Cell::new(false),
        })
    }

    // ========================================================================
    // Error routing
    // ========================================================================

    /// Error mode of the world communicator, used for errors that have no
    /// communicator of their own.
    pub(crate) fn world_errors(&self) -> ErrorMode {
        self.comms
            .borrow()
            .get(self.world)
            .map(|r| r.errors)
            .unwrap_or_default()
    }

    /// Deliver `result` according to `mode`: return it, or abort the universe.
    pub(crate) fn route<T>(&self, mode: ErrorMode, result: Result<T>) -> Result<T> {
        match result {
            Err(err) if mode == ErrorMode::Fatal && !err.is_recoverable() => self.abort(&err),
            other => other,
        }
    }

    /// Abort every process in the universe and unwind this one.
    pub(crate) fn abort(&self, err: &Error) -> ! {
        let code = match err {
            Error::Aborted(code) => *code,
            other => other.code(),
        };
        tracing::error!(process = %self.pid, code, error = %err, "fatal error, aborting universe");
        self.universe.abort(code);
        panic!("process {} aborted: {err}", self.pid);
    }

    // ========================================================================
    // Point-to-point substrate
    // ========================================================================

    /// Eagerly deliver `payload` to `dest`.
    pub(crate) fn send_to(
        &self,
        dest: ProcessId,
        context: ContextId,
        tag: i32,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.universe.transport.send(
            dest,
            Envelope {
                source: self.pid,
                context,
                tag,
                payload,
            },
        )
    }

    /// Post a receive; it will be matched in posting order.
    pub(crate) fn post(&self, matcher: Matcher) -> Rc<Posted> {
        let posted = Rc::new(Posted {
            matcher,
            slot: RefCell::new(None),
        });
        self.posted.borrow_mut().push(Rc::clone(&posted));
        posted
    }

    /// Blocking receive of one envelope.
    pub(crate) fn recv_from(
        &self,
        source: Option<ProcessId>,
        context: ContextId,
        tag: Option<i32>,
    ) -> Result<Envelope> {
        let posted = self.post(Matcher {
            context,
            source,
            tag,
        });
        self.wait_posted(&posted)
    }

    /// Block until `posted` is matched and take its envelope.
    pub(crate) fn wait_posted(&self, posted: &Rc<Posted>) -> Result<Envelope> {
        self.progress_until(|_| posted.is_complete())?;
        posted
            .take()
            .ok_or_else(|| Error::Internal("posted receive completed twice".into()))
    }

    /// Match posted receives against already-arrived messages without blocking.
    pub(crate) fn poll(&self) -> Result<()> {
        let mut state = self.mailbox.lock();
        if let Some(code) = state.aborted {
            return Err(Error::Aborted(code));
        }
        let mut posted = self.posted.borrow_mut();
        posted.retain(|p| match state.take(&p.matcher) {
            Some(envelope) => {
                *p.slot.borrow_mut() = Some(envelope);
                false
            }
            None => true,
        });
        Ok(())
    }

    /// Drive matching until `done` holds. `done` sees the queue of messages
    /// that no posted receive has claimed.
    pub(crate) fn progress_until(
        &self,
        mut done: impl FnMut(&MailboxState) -> bool,
    ) -> Result<()> {
        let mut state = self.mailbox.lock();
        loop {
            {
                let mut posted = self.posted.borrow_mut();
                posted.retain(|p| match state.take(&p.matcher) {
                    Some(envelope) => {
                        *p.slot.borrow_mut() = Some(envelope);
                        false
                    }
                    None => true,
                });
            }
            if done(&state) {
                return Ok(());
            }
            if let Some(code) = state.aborted {
                return Err(Error::Aborted(code));
            }
            self.mailbox.wait(&mut state);
        }
    }

    /// Block until a message accepted by `matcher` is available, without
    /// receiving it. Returns (source, tag, payload length).
    pub(crate) fn probe(&self, matcher: Matcher) -> Result<(ProcessId, i32, usize)> {
        let mut found = None;
        // Earlier posted receives get first pick; a probe never steals from them.
        self.progress_until(|state| {
            found = state
                .peek(&matcher)
                .map(|e| (e.source, e.tag, e.payload.len()));
            found.is_some()
        })?;
        found.ok_or_else(|| Error::Internal("probe finished without a match".into()))
    }

    /// Non-blocking form of [`probe`](Self::probe).
    pub(crate) fn iprobe(&self, matcher: Matcher) -> Result<Option<(ProcessId, i32, usize)>> {
        self.poll()?;
        Ok(self
            .mailbox
            .lock()
            .peek(&matcher)
            .map(|e| (e.source, e.tag, e.payload.len())))
    }

    /// Complete every posted receive on the given contexts.
    pub(crate) fn drain(&self, contexts: &[ContextId]) -> Result<()> {
        self.progress_until(|_| {
            !self
                .posted
                .borrow()
                .iter()
                .any(|p| contexts.contains(&p.matcher.context))
        })
    }

    /// Discard queued, unmatched messages on the given contexts.
    pub(crate) fn purge(&self, contexts: &[ContextId]) -> usize {
        self.mailbox.purge(contexts)
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.get()
    }

    pub(crate) fn mark_finalized(&self) {
        self.finalized.set(true);
    }
}
