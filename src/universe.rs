//! The runtime context: a universe of simulated processes.
//!
//! A [`Universe`] owns everything shared between processes: the mailbox
//! directory, the context-id allocator, the port table, the name registry
//! and the program registry used by spawn. [`Universe::launch`] starts a job
//! of `n` processes, each on its own thread with its own [`Mpi`] handle and
//! its own world communicator. Independently launched jobs share nothing but
//! the universe, and can only meet through ports or spawn.
//!
//! # Example
//!
//! ```
//! use mpirt::{Config, ReduceOp, Universe};
//!
//! let universe = Universe::new(Config::default());
//! universe
//!     .run(4, |mpi| {
//!         let world = mpi.world();
//!         let sum = world.allreduce_scalar(world.rank(), ReduceOp::Sum)?;
//!         assert_eq!(sum, 6);
//!         Ok(())
//!     })
//!     .unwrap();
//! ```

use crate::config::Config;
use crate::error::{Error, ErrorClass, Result};
use crate::group::{Group, ProcessId};
use crate::naming::NameRegistry;
use crate::port::PortTable;
use crate::process::{LaunchInfo, ProcessSeed, ProcessState};
use crate::transport::{ContextId, Transport};
use crate::Mpi;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A program that spawned processes can run, registered by name.
pub type Program = Arc<dyn Fn(Mpi) -> Result<()> + Send + Sync>;

/// State shared by every process of a universe.
pub(crate) struct UniverseInner {
    pub(crate) config: Config,
    pub(crate) transport: Transport,
    pub(crate) ports: PortTable,
    pub(crate) names: NameRegistry,
    programs: RwLock<HashMap<String, Program>>,
    next_pid: AtomicU64,
    next_context: AtomicU32,
    next_job: AtomicU64,
    live: AtomicUsize,
    aborted: Mutex<Option<i32>>,
    spawned: Mutex<Vec<ProcessHandle>>,
}

/// A running process thread.
struct ProcessHandle {
    rank: i32,
    pid: ProcessId,
    thread: JoinHandle<Result<()>>,
}

impl UniverseInner {
    /// Reserve `count` communicator context pairs; returns the first.
    pub(crate) fn allocate_contexts(&self, count: u32) -> ContextId {
        ContextId(self.next_context.fetch_add(2 * count, Ordering::Relaxed))
    }

    pub(crate) fn abort_code(&self) -> Option<i32> {
        *self.aborted.lock()
    }

    /// Abort every process: close all mailboxes and ports.
    pub(crate) fn abort(&self, code: i32) {
        {
            let mut aborted = self.aborted.lock();
            if aborted.is_some() {
                return;
            }
            *aborted = Some(code);
        }
        tracing::error!(code, "universe aborted");
        self.transport.close_all(code);
        self.ports.close_all(code);
    }

    pub(crate) fn program(&self, name: &str) -> Option<Program> {
        self.programs.read().get(name).cloned()
    }

    /// Processes that may still be started without exceeding the
    /// configured universe size.
    pub(crate) fn capacity(&self) -> Option<usize> {
        self.config
            .universe_size
            .map(|size| size.saturating_sub(self.live.load(Ordering::SeqCst)))
    }

    /// Start `count` processes forming one world.
    ///
    /// `parent`, if any, is the group of the spawning processes and the
    /// context of the parent intercommunicator.
    pub(crate) fn start_world(
        self: &Arc<Self>,
        count: usize,
        program: Program,
        launch: LaunchInfo,
        parent: Option<(Group, ContextId)>,
    ) -> Result<Vec<(i32, ProcessId, JoinHandle<Result<()>>)>> {
        if let Some(code) = self.abort_code() {
            return Err(Error::Aborted(code));
        }
        // Reserve slots up front so concurrent launches cannot overshoot.
        let reserved = self.live.fetch_add(count, Ordering::SeqCst);
        if let Some(size) = self.config.universe_size {
            if reserved + count > size {
                self.live.fetch_sub(count, Ordering::SeqCst);
                return Err(Error::ResourceExhausted(format!(
                    "{count} processes requested, {} of {size} slots free",
                    size.saturating_sub(reserved)
                )));
            }
        }

        let job = self.next_job.fetch_add(1, Ordering::Relaxed);
        let first = self.next_pid.fetch_add(count as u64, Ordering::Relaxed);
        let pids: Vec<ProcessId> = (first..first + count as u64).map(ProcessId).collect();
        let world = Group::from_members(pids.clone());
        let world_context = self.allocate_contexts(1);
        let mailboxes: Vec<_> = pids.iter().map(|&pid| self.transport.register(pid)).collect();
        tracing::debug!(job, count, first_pid = first, "launching processes");

        let mut handles = Vec::with_capacity(count);
        for (rank, (pid, mailbox)) in pids.into_iter().zip(mailboxes).enumerate() {
            let seed = ProcessSeed {
                pid,
                mailbox,
                world: world.clone(),
                world_context,
                self_context: self.allocate_contexts(1),
                parent: parent.clone(),
                launch: launch.clone(),
            };
            let universe = Arc::clone(self);
            let program = Arc::clone(&program);
            let spawned = thread::Builder::new()
                .name(format!("mpirt-job{job}-rank{rank}"))
                .spawn(move || run_process(universe, seed, program));
            match spawned {
                Ok(thread) => handles.push((rank as i32, pid, thread)),
                Err(err) => {
                    // Processes already started would wait forever for their peers.
                    self.live.fetch_sub(count - rank, Ordering::SeqCst);
                    self.abort(ErrorClass::NoResources as i32);
                    return Err(Error::ResourceExhausted(format!(
                        "cannot start process thread: {err}"
                    )));
                }
            }
        }
        Ok(handles)
    }

    pub(crate) fn track_spawned(&self, handles: Vec<(i32, ProcessId, JoinHandle<Result<()>>)>) {
        self.spawned.lock().extend(
            handles
                .into_iter()
                .map(|(rank, pid, thread)| ProcessHandle { rank, pid, thread }),
        );
    }
}

/// Releases a process slot when the process thread ends, and aborts the
/// universe if it ended by unwinding.
struct LiveGuard<'a> {
    universe: &'a UniverseInner,
    pid: ProcessId,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.universe.transport.unregister(self.pid);
        self.universe.live.fetch_sub(1, Ordering::SeqCst);
        if thread::panicking() {
            tracing::error!(process = %self.pid, "process panicked");
            self.universe.abort(-1);
        }
    }
}

fn run_process(universe: Arc<UniverseInner>, seed: ProcessSeed, program: Program) -> Result<()> {
    let _guard = LiveGuard {
        universe: &universe,
        pid: seed.pid,
    };
    let pid = seed.pid;
    let mpi = Mpi::from_state(ProcessState::from_seed(Arc::clone(&universe), seed));
    let result = program(mpi);
    if let Err(err) = &result {
        if !matches!(err, Error::Aborted(_)) {
            tracing::warn!(process = %pid, error = %err, "process exited with an error");
            universe.abort(err.code());
        }
    }
    result
}

/// A universe of simulated processes.
///
/// Cloning a `Universe` yields another handle to the same universe.
#[derive(Clone)]
pub struct Universe {
    inner: Arc<UniverseInner>,
}

impl Universe {
    /// Create an empty universe.
    pub fn new(config: Config) -> Self {
        Universe {
            inner: Arc::new(UniverseInner {
                config,
                transport: Transport::new(),
                ports: PortTable::new(),
                names: NameRegistry::new(),
                programs: RwLock::new(HashMap::new()),
                next_pid: AtomicU64::new(0),
                next_context: AtomicU32::new(0),
                next_job: AtomicU64::new(0),
                live: AtomicUsize::new(0),
                aborted: Mutex::new(None),
                spawned: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The configuration this universe was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Make `program` available to [`Communicator::spawn`](crate::Communicator::spawn)
    /// under `name`, replacing any earlier registration.
    pub fn register_program<F>(&self, name: &str, program: F)
    where
        F: Fn(Mpi) -> Result<()> + Send + Sync + 'static,
    {
        self.inner
            .programs
            .write()
            .insert(name.to_string(), Arc::new(program));
        tracing::debug!(name, "registered program");
    }

    /// Start `n` processes running `program`, each with its own [`Mpi`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if `n` is zero, [`Error::ResourceExhausted`] if
    /// `n` exceeds the free slots of the universe, [`Error::Aborted`] if the
    /// universe has already aborted.
    pub fn launch<F>(&self, n: usize, program: F) -> Result<Job>
    where
        F: Fn(Mpi) -> Result<()> + Send + Sync + 'static,
    {
        if n == 0 {
            return Err(Error::InvalidArg("a job needs at least one process".into()));
        }
        let handles =
            self.inner
                .start_world(n, Arc::new(program), LaunchInfo::default(), None)?;
        Ok(Job {
            universe: Arc::clone(&self.inner),
            processes: handles
                .into_iter()
                .map(|(rank, pid, thread)| ProcessHandle { rank, pid, thread })
                .collect(),
        })
    }

    /// Launch `n` processes, wait for them and for every process they
    /// spawned.
    pub fn run<F>(&self, n: usize, program: F) -> Result<()>
    where
        F: Fn(Mpi) -> Result<()> + Send + Sync + 'static,
    {
        let outcome = self.launch(n, program)?.wait();
        let spawned = self.wait_spawned();
        outcome.and(spawned)
    }

    /// Wait for every spawned process started so far, including processes
    /// spawned while waiting.
    pub fn wait_spawned(&self) -> Result<()> {
        let mut outcome = Outcome::default();
        loop {
            let batch: Vec<ProcessHandle> = std::mem::take(&mut *self.inner.spawned.lock());
            if batch.is_empty() {
                break;
            }
            for process in batch {
                outcome.record(&self.inner, process);
            }
        }
        outcome.finish()
    }

    /// Abort every process in the universe with `code`.
    pub fn abort(&self, code: i32) {
        self.inner.abort(code);
    }

    /// The abort code, if the universe has aborted.
    pub fn abort_code(&self) -> Option<i32> {
        self.inner.abort_code()
    }

    /// Number of processes currently running.
    pub fn live_processes(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }
}

impl Default for Universe {
    fn default() -> Self {
        Universe::new(Config::default())
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe")
            .field("config", &self.inner.config)
            .field("live", &self.live_processes())
            .field("aborted", &self.abort_code())
            .finish_non_exhaustive()
    }
}

/// A launched set of processes sharing one world communicator.
pub struct Job {
    universe: Arc<UniverseInner>,
    processes: Vec<ProcessHandle>,
}

impl Job {
    /// Process identities in world rank order.
    pub fn processes(&self) -> Vec<ProcessId> {
        self.processes.iter().map(|p| p.pid).collect()
    }

    /// Wait for every process of the job to finish.
    ///
    /// Returns the first error a process returned, or [`Error::Aborted`] if
    /// the universe aborted without a process reporting anything more
    /// specific.
    pub fn wait(self) -> Result<()> {
        let mut outcome = Outcome::default();
        for process in self.processes {
            outcome.record(&self.universe, process);
        }
        outcome.finish()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("processes", &self.processes())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Outcome {
    first_error: Option<Error>,
    aborted: Option<Error>,
}

impl Outcome {
    fn record(&mut self, universe: &UniverseInner, process: ProcessHandle) {
        let result = match process.thread.join() {
            Ok(result) => result,
            Err(_) => Err(match universe.abort_code() {
                Some(code) => Error::Aborted(code),
                None => Error::Internal(format!("rank {} panicked", process.rank)),
            }),
        };
        match result {
            Ok(()) => {}
            Err(err @ Error::Aborted(_)) => {
                self.aborted.get_or_insert(err);
            }
            Err(err) => {
                tracing::debug!(rank = process.rank, process = %process.pid, error = %err, "process failed");
                self.first_error.get_or_insert(err);
            }
        }
    }

    fn finish(self) -> Result<()> {
        match self.first_error.or(self.aborted) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorMode;

    #[test]
    fn run_gives_each_process_its_rank() {
        let universe = Universe::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        universe
            .run(3, move |mpi| {
                let world = mpi.world();
                sink.lock().push((world.rank(), world.size()));
                Ok(())
            })
            .unwrap();
        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 3), (1, 3), (2, 3)]);
        assert_eq!(universe.live_processes(), 0);
    }

    #[test]
    fn finished_processes_release_their_mailboxes() {
        let universe = Universe::default();
        for _ in 0..20 {
            universe
                .run(4, |mpi| {
                    let world = mpi.world();
                    let next = (world.rank() + 1) % world.size();
                    world.send(&[world.rank()], next, 0)?;
                    let mut got = [0i32];
                    world.recv(&mut got, crate::ANY_SOURCE, 0)?;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(universe.live_processes(), 0);
        assert_eq!(universe.inner.transport.len(), 0);
    }

    #[test]
    fn launch_respects_universe_size() {
        let universe = Universe::new(Config::default().with_universe_size(2));
        let err = universe.launch(3, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        universe.run(2, |_| Ok(())).unwrap();
        assert!(matches!(
            universe.launch(0, |_| Ok(())).unwrap_err(),
            Error::InvalidArg(_)
        ));
    }

    #[test]
    fn independent_jobs_have_distinct_processes() {
        let universe = Universe::default();
        let a = universe.launch(2, |_| Ok(())).unwrap();
        let b = universe.launch(2, |_| Ok(())).unwrap();
        let (pa, pb) = (a.processes(), b.processes());
        assert!(pa.iter().all(|p| !pb.contains(p)));
        a.wait().unwrap();
        b.wait().unwrap();
    }

    #[test]
    fn fatal_error_aborts_every_process() {
        let universe = Universe::default();
        let err = universe
            .run(3, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    // Invalid root under the default fatal mode.
                    let mut buf = [0i32; 1];
                    world.broadcast(&mut buf, 99)?;
                }
                // Blocks until the abort wakes it.
                let mut buf = [0i32; 1];
                world.recv(&mut buf, 0, 5)?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, Error::Aborted(Error::InvalidRoot(99).code()));
        assert!(universe.abort_code().is_some());
        assert!(matches!(
            universe.launch(1, |_| Ok(())).unwrap_err(),
            Error::Aborted(_)
        ));
    }

    #[test]
    fn returned_error_is_reported() {
        let universe = Universe::new(Config::default().with_errors(ErrorMode::Return));
        let err = universe
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 1 {
                    return Err(Error::InvalidArg("bail out".into()));
                }
                let mut buf = [0u8; 1];
                world.recv(&mut buf, 1, 0)?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, Error::InvalidArg("bail out".into()));
    }

    #[test]
    fn panicking_process_aborts_universe() {
        let universe = Universe::default();
        let err = universe
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    panic!("boom");
                }
                world.barrier()?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, Error::Aborted(-1));
    }
}
