//! Communicators: handle arena, lifecycle and point-to-point communication.
//!
//! Every process keeps its communicator records in a [`CommTable`]. A
//! [`Communicator`] value is a lightweight handle into that table; cloning it
//! adds a reference and dropping it releases one. A record is reclaimed once
//! it is freed (or is an ordinary derived communicator) and no handle refers
//! to it any more.
//!
//! Collective operations live in `collective.rs`, Cartesian topology in
//! `topology.rs` and the intercommunicator constructors in `port.rs` and
//! `spawn.rs`; they all extend [`Communicator`] with further `impl` blocks.

use crate::collective;
use crate::datatype::{to_bytes, MpiDatatype};
use crate::error::{Error, ErrorMode, Result};
use crate::group::{Group, GroupRelation, ProcessId};
use crate::process::ProcessState;
use crate::request::Request;
use crate::status::Status;
use crate::topology::CartTopology;
use crate::transport::{ContextId, Envelope, Matcher};
use crate::{ANY_SOURCE, ANY_TAG, MAX_OBJECT_NAME, PROC_NULL, UNDEFINED};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

/// Result of comparing two communicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicatorRelation {
    /// The same communicator handle
    Identical,
    /// Distinct communicators with the same members in the same order
    Congruent,
    /// Same members, different order
    Similar,
    /// Different members
    Unequal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommKind {
    World,
    SelfComm,
    Parent,
    User,
}

impl CommKind {
    fn is_permanent(self) -> bool {
        matches!(self, CommKind::World | CommKind::SelfComm)
    }
}

#[derive(Debug)]
pub(crate) struct CommRecord {
    pub(crate) group: Group,
    pub(crate) remote: Option<Group>,
    pub(crate) context: ContextId,
    pub(crate) rank: i32,
    pub(crate) topology: Option<CartTopology>,
    name: Option<String>,
    default_name: String,
    pub(crate) errors: ErrorMode,
    pub(crate) kind: CommKind,
    refs: usize,
    freed: bool,
}

impl CommRecord {
    pub(crate) fn new(
        group: Group,
        remote: Option<Group>,
        context: ContextId,
        me: ProcessId,
        kind: CommKind,
        default_name: String,
        errors: ErrorMode,
    ) -> Self {
        let rank = group.rank_of(me).unwrap_or(UNDEFINED);
        CommRecord {
            group,
            remote,
            context,
            rank,
            topology: None,
            name: None,
            default_name,
            errors,
            kind,
            refs: 0,
            freed: false,
        }
    }

    pub(crate) fn with_topology(mut self, topology: Option<CartTopology>) -> Self {
        self.topology = topology;
        self
    }
}

/// Per-process communicator arena.
#[derive(Debug, Default)]
pub(crate) struct CommTable {
    records: HashMap<i32, CommRecord>,
    next: i32,
}

impl CommTable {
    pub(crate) fn insert(&mut self, record: CommRecord) -> i32 {
        let handle = self.next;
        self.next += 1;
        self.records.insert(handle, record);
        handle
    }

    pub(crate) fn get(&self, handle: i32) -> Result<&CommRecord> {
        self.records
            .get(&handle)
            .filter(|r| !r.freed)
            .ok_or_else(|| Error::InvalidCommunicator(format!("handle {handle} is not live")))
    }

    fn get_mut(&mut self, handle: i32) -> Result<&mut CommRecord> {
        self.records
            .get_mut(&handle)
            .filter(|r| !r.freed)
            .ok_or_else(|| Error::InvalidCommunicator(format!("handle {handle} is not live")))
    }

    fn retain(&mut self, handle: i32) {
        if let Some(record) = self.records.get_mut(&handle) {
            record.refs += 1;
        }
    }

    fn release(&mut self, handle: i32) {
        let reclaim = match self.records.get_mut(&handle) {
            Some(record) => {
                record.refs = record.refs.saturating_sub(1);
                record.refs == 0 && (record.freed || record.kind == CommKind::User)
            }
            None => false,
        };
        if reclaim {
            self.records.remove(&handle);
        }
    }

    /// Apply releases deferred by [`release_handle`].
    fn release_deferred(&mut self, state: &ProcessState) {
        for handle in state.deferred_releases.take() {
            self.release(handle);
        }
    }

    fn mark_freed(&mut self, handle: i32) {
        if let Some(record) = self.records.get_mut(&handle) {
            record.freed = true;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Snapshot of a communicator record, taken so no table borrow is held
/// while communicating.
#[derive(Debug, Clone)]
pub(crate) struct CommView {
    pub(crate) group: Group,
    pub(crate) remote: Option<Group>,
    pub(crate) context: ContextId,
    pub(crate) rank: i32,
    pub(crate) topology: Option<CartTopology>,
    pub(crate) errors: ErrorMode,
    pub(crate) kind: CommKind,
}

impl CommView {
    fn of(record: &CommRecord) -> Self {
        CommView {
            group: record.group.clone(),
            remote: record.remote.clone(),
            context: record.context,
            rank: record.rank,
            topology: record.topology.clone(),
            errors: record.errors,
            kind: record.kind,
        }
    }

    pub(crate) fn size(&self) -> i32 {
        self.group.size()
    }

    /// The group point-to-point ranks refer to.
    pub(crate) fn peers(&self) -> &Group {
        self.remote.as_ref().unwrap_or(&self.group)
    }

    pub(crate) fn peer(&self, rank: i32) -> Result<ProcessId> {
        self.peers().process(rank).ok_or(Error::InvalidRank(rank))
    }

    /// Member of the local group, for collective traffic.
    pub(crate) fn member(&self, rank: i32) -> Result<ProcessId> {
        self.group.process(rank).ok_or(Error::InvalidRank(rank))
    }

    pub(crate) fn require_intra(&self, operation: &str) -> Result<()> {
        if self.remote.is_some() {
            return Err(Error::InvalidCommunicator(format!(
                "{operation} requires an intracommunicator"
            )));
        }
        Ok(())
    }

    pub(crate) fn check_root(&self, root: i32) -> Result<()> {
        if root < 0 || root >= self.size() {
            return Err(Error::InvalidRoot(root));
        }
        Ok(())
    }

    fn matcher(&self, source: i32, tag: i32) -> Result<Option<Matcher>> {
        if tag < 0 && tag != ANY_TAG {
            return Err(Error::InvalidTag(tag));
        }
        let source = match source {
            PROC_NULL => return Ok(None),
            ANY_SOURCE => None,
            rank => Some(self.peer(rank)?),
        };
        Ok(Some(Matcher {
            context: self.context,
            source,
            tag: (tag != ANY_TAG).then_some(tag),
        }))
    }
}

/// Copy a received payload into `data` and describe it.
fn deliver<T: MpiDatatype>(peers: &Group, envelope: &Envelope, data: &mut [T]) -> Status {
    let written = T::decode(&envelope.payload, data);
    Status::new(
        peers.rank_of(envelope.source).unwrap_or(UNDEFINED),
        envelope.tag,
        written as i64,
        (envelope.payload.len() / T::SIZE) as i64,
    )
}

fn send_payload(
    state: &ProcessState,
    view: &CommView,
    payload: Vec<u8>,
    dest: i32,
    tag: i32,
) -> Result<()> {
    if tag < 0 {
        return Err(Error::InvalidTag(tag));
    }
    if dest == PROC_NULL {
        return Ok(());
    }
    state.send_to(view.peer(dest)?, view.context, tag, payload)
}

/// Names keep at most `MAX_OBJECT_NAME - 1` bytes; trailing spaces are not
/// significant.
pub(crate) fn truncate_name(name: &str) -> String {
    let name = name.trim_end_matches(' ');
    let mut end = name.len().min(MAX_OBJECT_NAME - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Agree on `count` fresh context pairs: rank 0 allocates and broadcasts.
pub(crate) fn allocate_shared(
    state: &ProcessState,
    view: &CommView,
    count: u32,
) -> Result<ContextId> {
    let base = if view.rank == 0 {
        state.universe.allocate_contexts(count).0
    } else {
        0
    };
    let bytes = collective::bcast_bytes(state, view, to_bytes(&[base]), 0)?;
    let mut agreed = [0u32];
    u32::decode(&bytes, &mut agreed);
    Ok(ContextId(agreed[0]))
}

/// Partition the communicator by `color`, ordering each part by
/// `(key, old rank)`. Returns this process's part and its context.
pub(crate) fn split_group(
    state: &ProcessState,
    view: &CommView,
    color: i32,
    key: i32,
) -> Result<Option<(Group, ContextId)>> {
    let blocks = collective::allgather_bytes(state, view, to_bytes(&[color, key]))?;
    let entries: Vec<(i32, i32)> = blocks
        .iter()
        .map(|b| {
            let mut pair = [UNDEFINED, 0];
            i32::decode(b, &mut pair);
            (pair[0], pair[1])
        })
        .collect();
    let colors: BTreeSet<i32> = entries
        .iter()
        .map(|&(c, _)| c)
        .filter(|&c| c != UNDEFINED)
        .collect();
    let base = allocate_shared(state, view, colors.len() as u32)?;
    if color == UNDEFINED {
        return Ok(None);
    }
    let index = colors
        .iter()
        .position(|&c| c == color)
        .ok_or_else(|| Error::Internal(format!("color {color} missing after exchange")))?;
    let mut ranks: Vec<i32> = (0..view.size())
        .filter(|&r| entries[r as usize].0 == color)
        .collect();
    ranks.sort_by_key(|&r| (entries[r as usize].1, r));
    let group = view.group.include(&ranks)?;
    Ok(Some((group, ContextId(base.0 + 2 * index as u32))))
}

/// A communicator handle.
///
/// Values are tied to the process that created them and are neither `Send`
/// nor `Sync`.
///
/// # Example
///
/// ```
/// use mpirt::{Config, Universe};
///
/// Universe::new(Config::default())
///     .run(2, |mpi| {
///         let world = mpi.world();
///         println!("I am rank {} of {}", world.rank(), world.size());
///         Ok(())
///     })
///     .unwrap();
/// ```
pub struct Communicator {
    handle: i32,
    state: Option<Rc<ProcessState>>,
}

impl Communicator {
    pub(crate) fn from_handle(state: &Rc<ProcessState>, handle: i32) -> Self {
        {
            let mut comms = state.comms.borrow_mut();
            comms.retain(handle);
            comms.release_deferred(state);
        }
        Communicator {
            handle,
            state: Some(Rc::clone(state)),
        }
    }

    /// Store `record` and return a handle to it.
    pub(crate) fn adopt(state: &Rc<ProcessState>, record: CommRecord) -> Self {
        tracing::debug!(
            process = %state.pid,
            context = record.context.0,
            size = record.group.size(),
            inter = record.remote.is_some(),
            name = %record.default_name,
            "created communicator"
        );
        let handle = state.comms.borrow_mut().insert(record);
        Communicator::from_handle(state, handle)
    }

    /// The null communicator. Every operation on it fails with
    /// [`Error::InvalidCommunicator`].
    pub fn null() -> Self {
        Communicator {
            handle: -1,
            state: None,
        }
    }

    /// Whether this is the null communicator.
    pub fn is_null(&self) -> bool {
        self.state.is_none()
    }

    /// Get the raw communicator handle (for advanced use).
    pub fn raw_handle(&self) -> i32 {
        self.handle
    }

    pub(crate) fn process(&self) -> Result<&Rc<ProcessState>> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::InvalidCommunicator("null communicator".into()))
    }

    pub(crate) fn view(&self) -> Result<CommView> {
        let state = self.process()?;
        let comms = state.comms.borrow();
        comms.get(self.handle).map(CommView::of)
    }

    /// Error mode applied to failures of operations on this communicator.
    fn error_mode(&self) -> ErrorMode {
        match &self.state {
            Some(state) => state
                .comms
                .borrow()
                .get(self.handle)
                .map(|r| r.errors)
                .unwrap_or_else(|_| state.world_errors()),
            None => ErrorMode::Return,
        }
    }

    /// Run `f` against a snapshot of this communicator and route its error
    /// through the communicator's error mode.
    pub(crate) fn guard<R>(
        &self,
        f: impl FnOnce(&Rc<ProcessState>, &CommView) -> Result<R>,
    ) -> Result<R> {
        let state = self.process()?;
        let result = self.view().and_then(|view| f(state, &view));
        state.route(self.error_mode(), result)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Get the rank of the calling process in this communicator's (local)
    /// group, or [`UNDEFINED`] for an invalid communicator.
    pub fn rank(&self) -> i32 {
        self.view().map_or(UNDEFINED, |v| v.rank)
    }

    /// Get the number of processes in this communicator's (local) group, or
    /// 0 for an invalid communicator.
    pub fn size(&self) -> i32 {
        self.view().map_or(0, |v| v.size())
    }

    /// Whether this is an intercommunicator.
    pub fn is_inter(&self) -> bool {
        self.view().map_or(false, |v| v.remote.is_some())
    }

    /// Size of the remote group of an intercommunicator.
    pub fn remote_size(&self) -> Result<i32> {
        self.remote_group().map(|g| g.size())
    }

    /// The (local) group of this communicator.
    pub fn group(&self) -> Result<Group> {
        self.guard(|_, view| Ok(view.group.clone()))
    }

    /// The remote group of an intercommunicator.
    pub fn remote_group(&self) -> Result<Group> {
        self.guard(|_, view| {
            view.remote.clone().ok_or_else(|| {
                Error::InvalidCommunicator("not an intercommunicator".into())
            })
        })
    }

    /// Get the processor name for this process.
    pub fn processor_name(&self) -> Result<String> {
        self.guard(|state, _| Ok(state.universe.config.hostname.clone()))
    }

    /// Compare two communicators.
    ///
    /// For intercommunicators both the local and the remote groups are
    /// compared.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCommunicator`] if either side is null or freed.
    pub fn compare(&self, other: &Communicator) -> Result<CommunicatorRelation> {
        self.guard(|state, mine| {
            let theirs = other.view()?;
            let same_process = other.state.as_ref().map_or(false, |s| Rc::ptr_eq(s, state));
            if same_process && self.handle == other.handle {
                return Ok(CommunicatorRelation::Identical);
            }
            let local = mine.group.compare(&theirs.group);
            let remote = match (&mine.remote, &theirs.remote) {
                (None, None) => GroupRelation::Identical,
                (Some(a), Some(b)) => a.compare(b),
                _ => GroupRelation::Unequal,
            };
            Ok(match (local, remote) {
                (GroupRelation::Unequal, _) | (_, GroupRelation::Unequal) => {
                    CommunicatorRelation::Unequal
                }
                (GroupRelation::Identical, GroupRelation::Identical) => {
                    CommunicatorRelation::Congruent
                }
                _ => CommunicatorRelation::Similar,
            })
        })
    }

    // ========================================================================
    // Construction and teardown
    // ========================================================================

    /// Duplicate this communicator. Collective.
    ///
    /// The duplicate has the same group, topology and error mode, and a
    /// fresh context.
    pub fn duplicate(&self) -> Result<Self> {
        self.guard(|state, view| {
            view.require_intra("duplicate")?;
            let context = allocate_shared(state, view, 1)?;
            let record = CommRecord::new(
                view.group.clone(),
                None,
                context,
                state.pid,
                CommKind::User,
                format!("MPI COMMUNICATOR {} DUP FROM {}", context.0, view.context.0),
                view.errors,
            )
            .with_topology(view.topology.clone());
            Ok(Communicator::adopt(state, record))
        })
    }

    /// Split this communicator by `color`. Collective.
    ///
    /// Processes passing the same `color` end up in the same new
    /// communicator, ordered by `key` and then by their rank here. A process
    /// passing [`UNDEFINED`] gets `None`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a negative color other than `UNDEFINED`.
    pub fn split(&self, color: i32, key: i32) -> Result<Option<Self>> {
        self.guard(|state, view| {
            view.require_intra("split")?;
            if color < 0 && color != UNDEFINED {
                return Err(Error::InvalidArg(format!("split color {color} is negative")));
            }
            let part = split_group(state, view, color, key)?;
            Ok(part.map(|(group, context)| {
                Communicator::adopt(
                    state,
                    CommRecord::new(
                        group,
                        None,
                        context,
                        state.pid,
                        CommKind::User,
                        format!("MPI COMMUNICATOR {} SPLIT FROM {}", context.0, view.context.0),
                        view.errors,
                    ),
                )
            }))
        })
    }

    /// Create a communicator for `group`, a subset of this communicator's
    /// group. Collective; every process passes the same group. Processes
    /// outside `group` get `None`.
    pub fn create(&self, group: &Group) -> Result<Option<Self>> {
        self.guard(|state, view| {
            view.require_intra("create")?;
            if let Some(stranger) = group
                .members()
                .iter()
                .find(|pid| view.group.rank_of(**pid).is_none())
            {
                return Err(Error::InvalidGroup(format!(
                    "process {stranger} is not a member of the communicator"
                )));
            }
            let (color, key) = match group.rank_of(state.pid) {
                Some(rank) => (0, rank),
                None => (UNDEFINED, 0),
            };
            let part = split_group(state, view, color, key)?;
            Ok(part.map(|(group, context)| {
                Communicator::adopt(
                    state,
                    CommRecord::new(
                        group,
                        None,
                        context,
                        state.pid,
                        CommKind::User,
                        format!("MPI COMMUNICATOR {} CREATE FROM {}", context.0, view.context.0),
                        view.errors,
                    ),
                )
            }))
        })
    }

    /// Free this communicator.
    ///
    /// Blocks until every locally pending receive on it has completed, then
    /// invalidates the handle for every clone.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCommunicator`] for the world and self communicators
    /// and for handles that are not live.
    pub fn free(self) -> Result<()> {
        self.guard(|state, view| {
            if view.kind.is_permanent() {
                return Err(Error::InvalidCommunicator(format!(
                    "{} cannot be freed",
                    self.default_name()
                )));
            }
            state.drain(&[view.context, view.context.collective()])?;
            state.comms.borrow_mut().mark_freed(self.handle);
            tracing::debug!(process = %state.pid, context = view.context.0, "freed communicator");
            Ok(())
        })
    }

    pub(crate) fn mark_freed(&self) {
        if let Some(state) = &self.state {
            state.comms.borrow_mut().mark_freed(self.handle);
        }
    }

    fn default_name(&self) -> String {
        self.state
            .as_ref()
            .and_then(|s| {
                s.comms
                    .borrow()
                    .get(self.handle)
                    .ok()
                    .map(|r| r.default_name.clone())
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Names and error handling
    // ========================================================================

    /// Set the local display name. Longer names are truncated silently.
    pub fn set_name(&self, name: &str) -> Result<()> {
        let state = self.process()?;
        let result = state
            .comms
            .borrow_mut()
            .get_mut(self.handle)
            .map(|record| record.name = Some(truncate_name(name)));
        state.route(self.error_mode(), result)
    }

    /// The display name: the last name set, or the system default.
    pub fn get_name(&self) -> Result<String> {
        let state = self.process()?;
        let result = state.comms.borrow().get(self.handle).map(|record| {
            record
                .name
                .clone()
                .unwrap_or_else(|| record.default_name.clone())
        });
        state.route(self.error_mode(), result)
    }

    /// Choose how errors on this communicator are delivered.
    pub fn set_errhandler(&self, mode: ErrorMode) -> Result<()> {
        let state = self.process()?;
        let result = state
            .comms
            .borrow_mut()
            .get_mut(self.handle)
            .map(|record| record.errors = mode);
        state.route(self.error_mode(), result)
    }

    /// The current error mode.
    pub fn errhandler(&self) -> Result<ErrorMode> {
        self.guard(|_, view| Ok(view.errors))
    }

    /// Abort every process in the universe with `code`.
    pub fn abort(&self, code: i32) -> ! {
        match &self.state {
            Some(state) => state.abort(&Error::Aborted(code)),
            None => panic!("abort({code}) called on the null communicator"),
        }
    }

    // ========================================================================
    // Point-to-Point Communication
    // ========================================================================

    /// Send a slice to rank `dest`.
    ///
    /// Sends are eager: the data is copied out before this returns. Sending
    /// to [`PROC_NULL`] succeeds without effect.
    pub fn send<T: MpiDatatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        self.guard(|state, view| send_payload(state, view, to_bytes(data), dest, tag))
    }

    /// Receive into `data` from rank `source`.
    ///
    /// Use [`ANY_SOURCE`] and [`ANY_TAG`] as wildcards. A message longer
    /// than `data` is truncated; see [`Status::is_truncated`].
    pub fn recv<T: MpiDatatype>(&self, data: &mut [T], source: i32, tag: i32) -> Result<Status> {
        self.guard(|state, view| match view.matcher(source, tag)? {
            None => Ok(Status::empty(PROC_NULL)),
            Some(matcher) => {
                let envelope = state.wait_posted(&state.post(matcher))?;
                Ok(deliver(view.peers(), &envelope, data))
            }
        })
    }

    /// Start a send. The data is copied out at once, so the returned
    /// request is already complete.
    pub fn isend<T: MpiDatatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<Request<'static>> {
        let mode = self.error_mode();
        self.guard(|state, view| {
            send_payload(state, view, to_bytes(data), dest, tag)?;
            let count = data.len() as i64;
            Ok(Request::completed(
                state,
                mode,
                Status::new(view.rank, tag, count, count),
            ))
        })
    }

    /// Start a receive into `data`.
    ///
    /// Receives are matched in the order they were posted, so an earlier
    /// `irecv` gets first pick of a message over a later `recv`.
    pub fn irecv<'a, T: MpiDatatype>(
        &self,
        data: &'a mut [T],
        source: i32,
        tag: i32,
    ) -> Result<Request<'a>> {
        let mode = self.error_mode();
        self.guard(|state, view| match view.matcher(source, tag)? {
            None => Ok(Request::completed(state, mode, Status::empty(PROC_NULL))),
            Some(matcher) => {
                let posted = state.post(matcher);
                let peers = view.peers().clone();
                Ok(Request::receive(
                    state,
                    mode,
                    posted,
                    Box::new(move |envelope: Envelope| deliver(&peers, &envelope, data)),
                ))
            }
        })
    }

    /// Send `send` to `dest` and receive into `recv` from `source`.
    #[allow(clippy::too_many_arguments)]
    pub fn sendrecv<T: MpiDatatype, U: MpiDatatype>(
        &self,
        send: &[T],
        dest: i32,
        sendtag: i32,
        recv: &mut [U],
        source: i32,
        recvtag: i32,
    ) -> Result<Status> {
        self.guard(|state, view| {
            let posted = view.matcher(source, recvtag)?.map(|m| state.post(m));
            send_payload(state, view, to_bytes(send), dest, sendtag)?;
            match posted {
                None => Ok(Status::empty(PROC_NULL)),
                Some(posted) => {
                    let envelope = state.wait_posted(&posted)?;
                    Ok(deliver(view.peers(), &envelope, recv))
                }
            }
        })
    }

    /// Send `data` to `dest`, then replace it with a message from `source`.
    pub fn sendrecv_replace<T: MpiDatatype>(
        &self,
        data: &mut [T],
        dest: i32,
        sendtag: i32,
        source: i32,
        recvtag: i32,
    ) -> Result<Status> {
        self.guard(|state, view| {
            let posted = view.matcher(source, recvtag)?.map(|m| state.post(m));
            send_payload(state, view, to_bytes(data), dest, sendtag)?;
            match posted {
                None => Ok(Status::empty(PROC_NULL)),
                Some(posted) => {
                    let envelope = state.wait_posted(&posted)?;
                    Ok(deliver(view.peers(), &envelope, data))
                }
            }
        })
    }

    /// Block until a message from `source` with `tag` can be received,
    /// without receiving it. `count` is measured in elements of `T`.
    pub fn probe<T: MpiDatatype>(&self, source: i32, tag: i32) -> Result<Status> {
        self.guard(|state, view| match view.matcher(source, tag)? {
            None => Ok(Status::empty(PROC_NULL)),
            Some(matcher) => {
                let (pid, tag, len) = state.probe(matcher)?;
                Ok(probe_status::<T>(view, pid, tag, len))
            }
        })
    }

    /// Non-blocking [`probe`](Self::probe).
    pub fn iprobe<T: MpiDatatype>(&self, source: i32, tag: i32) -> Result<Option<Status>> {
        self.guard(|state, view| match view.matcher(source, tag)? {
            None => Ok(Some(Status::empty(PROC_NULL))),
            Some(matcher) => Ok(state
                .iprobe(matcher)?
                .map(|(pid, tag, len)| probe_status::<T>(view, pid, tag, len))),
        })
    }
}

fn probe_status<T: MpiDatatype>(view: &CommView, pid: ProcessId, tag: i32, len: usize) -> Status {
    let count = (len / T::SIZE) as i64;
    Status::new(
        view.peers().rank_of(pid).unwrap_or(UNDEFINED),
        tag,
        count,
        count,
    )
}

impl Clone for Communicator {
    fn clone(&self) -> Self {
        match &self.state {
            Some(state) => Communicator::from_handle(state, self.handle),
            None => Communicator::null(),
        }
    }
}

/// Drop one reference to `handle`, or queue the release if the table is
/// borrowed further up the stack.
fn release_handle(state: &ProcessState, handle: i32) {
    match state.comms.try_borrow_mut() {
        Ok(mut comms) => {
            comms.release(handle);
            comms.release_deferred(state);
        }
        Err(_) => {
            tracing::debug!(process = %state.pid, handle, "communicator table busy, deferring release");
            state.deferred_releases.borrow_mut().push(handle);
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            release_handle(state, self.handle);
        }
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Communicator");
        s.field("handle", &self.handle);
        if let Ok(view) = self.view() {
            s.field("context", &view.context.0)
                .field("rank", &view.rank)
                .field("size", &view.size())
                .field("inter", &view.remote.is_some());
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Universe};

    fn returning() -> Universe {
        Universe::new(Config::default().with_errors(ErrorMode::Return))
    }

    #[test]
    fn truncate_name_rules() {
        assert_eq!(truncate_name("comm-0   "), "comm-0");
        let long = "x".repeat(300);
        assert_eq!(truncate_name(&long).len(), MAX_OBJECT_NAME - 1);
        // Multi-byte characters are never split.
        let wide = "é".repeat(100);
        let cut = truncate_name(&wide);
        assert!(cut.len() <= MAX_OBJECT_NAME - 1);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn default_and_custom_names() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                assert_eq!(world.get_name()?, "MPI_COMM_WORLD");
                assert_eq!(mpi.self_comm().get_name()?, "MPI_COMM_SELF");
                let dup = world.duplicate()?;
                assert!(dup.get_name()?.starts_with("MPI COMMUNICATOR "));
                assert!(dup.get_name()?.contains("DUP FROM"));
                dup.set_name("comm-0")?;
                assert_eq!(dup.get_name()?, "comm-0");
                // Names are local: the clone shares the record.
                assert_eq!(dup.clone().get_name()?, "comm-0");
                dup.free()?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn compare_relations() {
        returning()
            .run(3, |mpi| {
                let world = mpi.world();
                assert_eq!(world.compare(&mpi.world())?, CommunicatorRelation::Identical);
                let dup = world.duplicate()?;
                assert_eq!(world.compare(&dup)?, CommunicatorRelation::Congruent);
                let reversed = world.split(0, -world.rank())?.unwrap();
                assert_eq!(world.compare(&reversed)?, CommunicatorRelation::Similar);
                assert_eq!(
                    world.compare(&mpi.self_comm())?,
                    CommunicatorRelation::Unequal
                );
                assert!(matches!(
                    world.compare(&Communicator::null()).unwrap_err(),
                    Error::InvalidCommunicator(_)
                ));
                assert!(matches!(
                    Communicator::null().compare(&world).unwrap_err(),
                    Error::InvalidCommunicator(_)
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn split_by_parity() {
        returning()
            .run(5, |mpi| {
                let world = mpi.world();
                let rank = world.rank();
                let color = if rank == 4 { UNDEFINED } else { rank % 2 };
                let part = world.split(color, -rank)?;
                if rank == 4 {
                    assert!(part.is_none());
                    return Ok(());
                }
                let part = part.unwrap();
                assert_eq!(part.size(), 2);
                // Keys are descending ranks, so the higher rank comes first.
                let expected = if rank < 2 { 1 } else { 0 };
                assert_eq!(part.rank(), expected);
                let mut total = [0i32];
                part.allreduce(&[rank], &mut total, crate::ReduceOp::Sum)?;
                assert_eq!(total[0], if color == 0 { 2 } else { 4 });
                assert!(part.get_name()?.contains("SPLIT FROM"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn split_rejects_negative_color() {
        returning()
            .run(1, |mpi| {
                let err = mpi.world().split(-5, 0).unwrap_err();
                assert!(matches!(err, Error::InvalidArg(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn create_from_subgroup() {
        returning()
            .run(4, |mpi| {
                let world = mpi.world();
                let evens = world.group()?.include(&[2, 0])?;
                let comm = world.create(&evens)?;
                match world.rank() {
                    0 => assert_eq!(comm.unwrap().rank(), 1),
                    2 => assert_eq!(comm.unwrap().rank(), 0),
                    _ => assert!(comm.is_none()),
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn free_invalidates_every_clone() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                let dup = world.duplicate()?;
                let alias = dup.clone();
                dup.free()?;
                assert!(matches!(
                    alias.barrier().unwrap_err(),
                    Error::InvalidCommunicator(_)
                ));
                assert!(matches!(
                    mpi.world().free().unwrap_err(),
                    Error::InvalidCommunicator(_)
                ));
                assert!(matches!(
                    mpi.self_comm().free().unwrap_err(),
                    Error::InvalidCommunicator(_)
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn free_waits_for_pending_receive() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                let dup = world.duplicate()?;
                if world.rank() == 0 {
                    let mut buf = [0i32; 2];
                    let request = dup.irecv(&mut buf, 1, 3)?;
                    // Blocks until rank 1's message lands in the posted receive.
                    dup.free()?;
                    assert!(request.is_completed());
                    request.wait()?;
                    assert_eq!(buf, [5, 6]);
                } else {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    dup.send(&[5i32, 6], 0, 3)?;
                    dup.free()?;
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn dropped_handles_are_reclaimed() {
        returning()
            .run(1, |mpi| {
                let world = mpi.world();
                let before = world.process()?.comms.borrow().len();
                for _ in 0..5 {
                    let _ = world.duplicate()?;
                }
                assert_eq!(world.process()?.comms.borrow().len(), before);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn point_to_point_fifo_and_wildcards() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    world.send(&[1i32], 1, 7)?;
                    world.send(&[2i32], 1, 7)?;
                    world.send(&[3i32], 1, 9)?;
                } else {
                    let mut buf = [0i32];
                    let status = world.recv(&mut buf, ANY_SOURCE, 9)?;
                    assert_eq!((buf[0], status.source, status.tag), (3, 0, 9));
                    world.recv(&mut buf, 0, ANY_TAG)?;
                    assert_eq!(buf[0], 1);
                    world.recv(&mut buf, 0, 7)?;
                    assert_eq!(buf[0], 2);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn truncated_receive_completes() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    world.send(&[1u64, 2, 3, 4], 1, 0)?;
                } else {
                    let mut small = [0u64; 2];
                    let status = world.recv(&mut small, 0, 0)?;
                    assert_eq!(small, [1, 2]);
                    assert_eq!((status.count, status.expected), (2, 4));
                    assert!(status.truncation().is_some());
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn proc_null_and_bad_arguments() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                world.send(&[1i32], PROC_NULL, 0)?;
                let mut buf = [9i32];
                let status = world.recv(&mut buf, PROC_NULL, 0)?;
                assert_eq!((status.source, status.count, buf[0]), (PROC_NULL, 0, 9));
                assert_eq!(world.send(&[1i32], 5, 0).unwrap_err(), Error::InvalidRank(5));
                assert_eq!(world.send(&[1i32], 0, -3).unwrap_err(), Error::InvalidTag(-3));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn earlier_irecv_matches_first() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    world.send(&[10i32], 1, 1)?;
                    world.send(&[20i32], 1, 1)?;
                } else {
                    let mut first = [0i32];
                    let mut second = [0i32];
                    let request = world.irecv(&mut first, 0, 1)?;
                    world.recv(&mut second, 0, 1)?;
                    request.wait()?;
                    assert_eq!((first[0], second[0]), (10, 20));
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn probe_then_receive() {
        returning()
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 1 {
                    world.send(&[0.5f32; 6], 0, 4)?;
                } else {
                    let status = world.probe::<f32>(ANY_SOURCE, ANY_TAG)?;
                    assert_eq!((status.source, status.tag, status.count), (1, 4, 6));
                    let mut buf = vec![0.0f32; status.count as usize];
                    world.recv(&mut buf, status.source, status.tag)?;
                    assert!(world.iprobe::<f32>(1, 4)?.is_none());
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn sendrecv_replace_ring() {
        returning()
            .run(4, |mpi| {
                let world = mpi.world();
                let (rank, size) = (world.rank(), world.size());
                let mut token = [rank, rank * 10];
                let status = world.sendrecv_replace(
                    &mut token,
                    (rank + 1) % size,
                    0,
                    (rank + size - 1) % size,
                    0,
                )?;
                let left = (rank + size - 1) % size;
                assert_eq!(token, [left, left * 10]);
                assert_eq!(status.source, left);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn drop_while_table_borrowed_is_released_later() {
        returning()
            .run(1, |mpi| {
                let world = mpi.world();
                let state = Rc::clone(mpi.state());
                let dup = world.duplicate()?;
                let handle = dup.handle;
                {
                    let _busy = state.comms.borrow();
                    drop(dup);
                }
                assert_eq!(*state.deferred_releases.borrow(), vec![handle]);
                assert!(state.comms.borrow().records.contains_key(&handle));

                let other = world.duplicate()?;
                assert!(state.deferred_releases.borrow().is_empty());
                assert!(!state.comms.borrow().records.contains_key(&handle));
                other.free()?;
                Ok(())
            })
            .unwrap();
    }
}
