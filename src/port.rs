//! Ports and the connect/accept rendezvous.
//!
//! Every port is an independent state machine with its own lock and
//! condition variable:
//!
//! ```text
//! Open --accept--> Accepting --connect arrives--> Matched --> Accepting | Open
//!   \                                                              |
//!    `------------------------- close_port ----------------------> Closed
//! ```
//!
//! A connect enqueues a request on the port and waits on its own handoff
//! slot; an accept takes queued requests in arrival order. Nothing here
//! ever holds two port locks, so matching on one port cannot stall
//! matching on another.

use crate::collective;
use crate::comm::{CommKind, CommRecord, CommView, Communicator};
use crate::datatype::{from_bytes, to_bytes};
use crate::error::{Error, Result};
use crate::group::{Group, ProcessId};
use crate::info::{Info, PortHints};
use crate::process::ProcessState;
use crate::transport::ContextId;
use crate::{Mpi, MAX_PORT_NAME};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const TAG_DISCONNECT: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortPhase {
    Open,
    Accepting,
    Matched,
    Closed,
}

/// The far side of a rendezvous: its group and the shared context.
pub(crate) struct Link {
    pub(crate) remote: Group,
    pub(crate) context: ContextId,
}

/// Reply slot a connector waits on.
#[derive(Default)]
struct Handoff {
    slot: Mutex<Option<Result<Link>>>,
    filled: Condvar,
}

impl Handoff {
    fn fill(&self, outcome: Result<Link>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.filled.notify_all();
        }
    }

    fn wait(&self) -> Result<Link> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            self.filled.wait(&mut slot);
        }
    }
}

struct ConnectRequest {
    group: Group,
    reply: Arc<Handoff>,
}

struct PortState {
    phase: PortPhase,
    accepting: usize,
    queue: VecDeque<ConnectRequest>,
    aborted: Option<i32>,
}

impl PortState {
    fn closed_error(&self, name: &str) -> Error {
        match self.aborted {
            Some(code) => Error::Aborted(code),
            None => Error::InvalidPort(format!("port '{name}' is closed")),
        }
    }
}

pub(crate) struct Port {
    name: String,
    state: Mutex<PortState>,
    changed: Condvar,
}

impl Port {
    fn new(name: String) -> Self {
        Port {
            name,
            state: Mutex::new(PortState {
                phase: PortPhase::Open,
                accepting: 0,
                queue: VecDeque::new(),
                aborted: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Wait for the next connect request and link it to `group`. The
    /// context is allocated only once a connector has been matched.
    fn accept(&self, group: Group, allocate: impl FnOnce() -> ContextId) -> Result<Link> {
        let mut state = self.state.lock();
        if state.phase == PortPhase::Closed {
            return Err(state.closed_error(&self.name));
        }
        state.accepting += 1;
        state.phase = PortPhase::Accepting;
        tracing::debug!(port = %self.name, "accepting");
        let request = loop {
            if state.phase == PortPhase::Closed {
                return Err(state.closed_error(&self.name));
            }
            if let Some(request) = state.queue.pop_front() {
                break request;
            }
            self.changed.wait(&mut state);
        };
        state.phase = PortPhase::Matched;
        let context = allocate();
        tracing::debug!(
            port = %self.name,
            context = context.0,
            remote_size = request.group.size(),
            "matched connect"
        );
        request.reply.fill(Ok(Link {
            remote: group,
            context,
        }));
        state.accepting -= 1;
        state.phase = if state.accepting > 0 {
            PortPhase::Accepting
        } else {
            PortPhase::Open
        };
        Ok(Link {
            remote: request.group,
            context,
        })
    }

    /// Queue a connect request from `group`; the returned handoff is filled
    /// by the matching accept.
    fn connect(&self, group: Group) -> Result<Arc<Handoff>> {
        let mut state = self.state.lock();
        if state.phase == PortPhase::Closed {
            return Err(state.closed_error(&self.name));
        }
        let reply = Arc::new(Handoff::default());
        state.queue.push_back(ConnectRequest {
            group,
            reply: Arc::clone(&reply),
        });
        tracing::debug!(port = %self.name, queued = state.queue.len(), "connect queued");
        self.changed.notify_all();
        Ok(reply)
    }

    fn close(&self, aborted: Option<i32>) {
        let mut state = self.state.lock();
        if state.phase == PortPhase::Closed {
            return;
        }
        state.phase = PortPhase::Closed;
        state.aborted = aborted;
        let err = state.closed_error(&self.name);
        for request in state.queue.drain(..) {
            request.reply.fill(Err(err.clone()));
        }
        self.changed.notify_all();
        tracing::debug!(port = %self.name, "closed");
    }
}

/// Every open port in a universe.
#[derive(Default)]
pub(crate) struct PortTable {
    ports: RwLock<HashMap<String, Arc<Port>>>,
    next: AtomicU64,
}

impl PortTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open(&self, host: &str, hints: &PortHints) -> Result<String> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let host = hints.ip_address.as_deref().unwrap_or(host);
        let name = format!(
            "port#{n}$host#{host}$ip_port#{}$",
            hints.ip_port.unwrap_or(0)
        );
        if name.len() > MAX_PORT_NAME {
            return Err(Error::InvalidInfo(format!(
                "port name would exceed {MAX_PORT_NAME} bytes"
            )));
        }
        self.ports
            .write()
            .insert(name.clone(), Arc::new(Port::new(name.clone())));
        tracing::debug!(port = %name, "opened port");
        Ok(name)
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<Arc<Port>> {
        self.ports
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidPort(format!("no open port named '{name}'")))
    }

    pub(crate) fn close(&self, name: &str) -> Result<()> {
        let port = self
            .ports
            .write()
            .remove(name)
            .ok_or_else(|| Error::InvalidPort(format!("no open port named '{name}'")))?;
        port.close(None);
        Ok(())
    }

    /// Close every port, failing blocked accepts and connects with
    /// `Aborted(code)`.
    pub(crate) fn close_all(&self, code: i32) {
        for (_, port) in self.ports.write().drain() {
            port.close(Some(code));
        }
    }
}

/// Broadcast the root's rendezvous outcome over `view`. Every process gets
/// the same link or the same error class; the root keeps its own error.
pub(crate) fn share_link(
    state: &ProcessState,
    view: &CommView,
    root: i32,
    outcome: Option<Result<Link>>,
) -> Result<Link> {
    let words: Vec<u64> = match &outcome {
        Some(Ok(link)) => [0, u64::from(link.context.0)]
            .into_iter()
            .chain(link.remote.members().iter().map(|p| p.0))
            .collect(),
        Some(Err(err)) => vec![err.code() as u64],
        None => Vec::new(),
    };
    let bytes = collective::bcast_bytes(state, view, to_bytes(&words), root)?;
    if let Some(outcome) = outcome {
        return outcome;
    }
    let words: Vec<u64> = from_bytes(&bytes);
    let (&code, rest) = words
        .split_first()
        .ok_or_else(|| Error::Internal("empty rendezvous outcome".into()))?;
    Error::check(code as i32, "rendezvous failed at the root")?;
    let (&context, members) = rest
        .split_first()
        .ok_or_else(|| Error::Internal("rendezvous outcome without a context".into()))?;
    Ok(Link {
        remote: Group::from_members(members.iter().map(|&p| ProcessId(p)).collect()),
        context: ContextId(context as u32),
    })
}

/// Store an intercommunicator for `link` on top of `view`'s group.
pub(crate) fn adopt_link(
    state: &std::rc::Rc<ProcessState>,
    view: &CommView,
    link: Link,
    how: &str,
) -> Communicator {
    Communicator::adopt(
        state,
        CommRecord::new(
            view.group.clone(),
            Some(link.remote),
            link.context,
            state.pid,
            CommKind::User,
            format!("MPI COMMUNICATOR {} {how} FROM {}", link.context.0, view.context.0),
            view.errors,
        ),
    )
}

impl Mpi {
    /// Open a new port and return its name.
    ///
    /// `ip_port` and `ip_address` hints are folded into the name.
    pub fn open_port(&self, info: &Info) -> Result<String> {
        let state = self.state();
        let result = PortHints::from_info(info)
            .and_then(|hints| state.universe.ports.open(&state.universe.config.hostname, &hints));
        state.route(state.world_errors(), result)
    }

    /// Close a port. Accepts blocked on it and connects queued on it fail
    /// with [`Error::InvalidPort`].
    pub fn close_port(&self, port: &str) -> Result<()> {
        let state = self.state();
        state.route(state.world_errors(), state.universe.ports.close(port))
    }
}

impl Communicator {
    // ========================================================================
    // Rendezvous
    // ========================================================================

    /// Accept a connection on `port`. Collective; only `root`'s `port` is
    /// significant.
    ///
    /// Returns an intercommunicator whose remote group is the connecting
    /// communicator's group.
    pub fn accept(&self, port: &str, _info: &Info, root: i32) -> Result<Self> {
        self.guard(|state, view| {
            view.require_intra("accept")?;
            view.check_root(root)?;
            let outcome = (view.rank == root).then(|| {
                state.universe.ports.lookup(port).and_then(|port| {
                    port.accept(view.group.clone(), || state.universe.allocate_contexts(1))
                })
            });
            let link = share_link(state, view, root, outcome)?;
            Ok(adopt_link(state, view, link, "ACCEPT"))
        })
    }

    /// Connect to `port`. Collective; only `root`'s `port` is significant.
    ///
    /// Blocks until an accept on the same port takes this request. Requests
    /// queued on one port are matched in arrival order.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPort`] if the port is unknown or closed before the
    /// request is matched.
    pub fn connect(&self, port: &str, _info: &Info, root: i32) -> Result<Self> {
        self.guard(|state, view| {
            view.require_intra("connect")?;
            view.check_root(root)?;
            let outcome = (view.rank == root).then(|| {
                state
                    .universe
                    .ports
                    .lookup(port)
                    .and_then(|port| port.connect(view.group.clone()))
                    .and_then(|handoff| handoff.wait())
            });
            let link = share_link(state, view, root, outcome)?;
            Ok(adopt_link(state, view, link, "CONNECT"))
        })
    }

    /// Disconnect and free this communicator. Collective over both groups
    /// of an intercommunicator.
    ///
    /// Completes every locally pending receive, then exchanges a token with
    /// every remote process (or runs a barrier on an intracommunicator).
    /// Channels are FIFO, so once the tokens have arrived all earlier
    /// traffic has been delivered; anything left unclaimed is discarded.
    pub fn disconnect(self) -> Result<()> {
        self.guard(|state, view| {
            if matches!(view.kind, CommKind::World | CommKind::SelfComm) {
                return Err(Error::InvalidCommunicator(
                    "the world and self communicators cannot be disconnected".into(),
                ));
            }
            let contexts = [view.context, view.context.collective()];
            state.drain(&contexts)?;
            match &view.remote {
                Some(remote) => {
                    let context = view.context.collective();
                    for &peer in remote.members() {
                        state.send_to(peer, context, TAG_DISCONNECT, Vec::new())?;
                    }
                    for &peer in remote.members() {
                        state.recv_from(Some(peer), context, Some(TAG_DISCONNECT))?;
                    }
                }
                None => collective::barrier(state, view)?,
            }
            let purged = state.purge(&contexts);
            self.mark_freed();
            tracing::debug!(
                process = %state.pid,
                context = view.context.0,
                purged,
                "disconnected communicator"
            );
            Ok(())
        })
    }
}
