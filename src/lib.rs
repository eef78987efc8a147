//! # mpirt
//!
//! An in-process runtime core for a message-passing standard.
//!
//! A [`Universe`] hosts simulated processes, each running on its own thread
//! with its own [`Mpi`] handle. The crate provides:
//! - Groups and communicators (duplicate, split, create, compare, names)
//! - Point-to-point messaging with FIFO matching and wildcards
//! - Collectives: barrier, broadcast, gather/scatter, allgather(v), reduce
//! - User-defined reduction operators
//! - Cartesian topologies
//! - Ports, connect/accept, a name service and spawning of registered
//!   programs
//!
//! ## Supported Types
//!
//! All communication operations are generic over [`MpiDatatype`]:
//! `f32`, `f64`, `i32`, `i64`, `u8`, `u32`, `u64`
//!
//! ## Quick Start
//!
//! ```
//! use mpirt::{Config, ReduceOp, Universe};
//!
//! fn main() -> Result<(), mpirt::Error> {
//!     let universe = Universe::new(Config::default());
//!     universe.run(4, |mpi| {
//!         let world = mpi.world();
//!
//!         let rank = world.rank();
//!         let size = world.size();
//!         println!("Hello from rank {} of {}", rank, size);
//!
//!         // Any MpiDatatype can be broadcast
//!         let mut data = vec![0.0f64; 100];
//!         if rank == 0 {
//!             data.fill(42.0);
//!         }
//!         world.broadcast(&mut data, 0)?;
//!
//!         // Generic all-reduce
//!         let sum = world.allreduce_scalar(rank as f64, ReduceOp::Sum)?;
//!         assert_eq!(sum, 6.0);
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Error handling
//!
//! Errors are fatal by default: the first error aborts every process of the
//! universe and [`Job::wait`] reports [`Error::Aborted`]. Switch a
//! communicator to [`ErrorMode::Return`] with
//! [`Communicator::set_errhandler`], or the whole universe with
//! [`Config::with_errors`] or `MPIRT_ERRORS=return`, to get errors back as
//! values instead.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]

mod collective;
mod comm;
mod config;
mod datatype;
mod error;
mod group;
mod info;
mod naming;
mod op;
mod port;
mod process;
mod request;
mod spawn;
mod status;
mod topology;
mod transport;
mod universe;

pub use comm::{Communicator, CommunicatorRelation};
pub use config::Config;
pub use datatype::{DatatypeTag, MpiDatatype};
pub use error::{error_string, Error, ErrorClass, ErrorMode, Result};
pub use group::{Group, GroupRelation, ProcessId};
pub use info::{Info, PortHints, SoftCounts, SpawnHints, RECOGNIZED_KEYS};
pub use op::Op;
pub use request::Request;
pub use spawn::SpawnResult;
pub use status::Status;
pub use topology::{dims_create, CartesianLayout, TopologyKind};
pub use universe::{Job, Program, Universe};

use process::ProcessState;
use std::rc::Rc;

/// Null process: sends to it and receives from it complete at once.
pub const PROC_NULL: i32 = -2;
/// Wildcard source for receives and probes.
pub const ANY_SOURCE: i32 = -1;
/// Wildcard tag for receives and probes.
pub const ANY_TAG: i32 = -1;
/// Undefined value, e.g. the split color that opts out.
pub const UNDEFINED: i32 = -32766;
/// Maximum length of a port name, in bytes.
pub const MAX_PORT_NAME: usize = 256;
/// Maximum length of an object name including its terminator, in bytes.
pub const MAX_OBJECT_NAME: usize = 128;
/// Maximum length of an info key, in bytes.
pub const MAX_INFO_KEY: usize = 255;
/// Maximum length of an info value, in bytes.
pub const MAX_INFO_VAL: usize = 1024;
/// Version of the standard implemented.
pub const VERSION: i32 = 3;
/// Subversion of the standard implemented.
pub const SUBVERSION: i32 = 1;

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
}

/// Per-process environment handle.
///
/// Every process started by a [`Universe`] receives one. It is neither
/// `Send` nor `Sync`: communicators and operators created through it belong
/// to that process.
///
/// # Example
///
/// ```
/// use mpirt::Universe;
///
/// Universe::default()
///     .run(2, |mpi| {
///         let world = mpi.world();
///         println!("Running on {} processes", world.size());
///         mpi.finalize()
///     })
///     .unwrap();
/// ```
pub struct Mpi {
    state: Rc<ProcessState>,
}

impl Mpi {
    pub(crate) fn from_state(state: Rc<ProcessState>) -> Self {
        Mpi { state }
    }

    pub(crate) fn state(&self) -> &Rc<ProcessState> {
        &self.state
    }

    /// Get a handle to the world communicator of this process's job.
    pub fn world(&self) -> Communicator {
        Communicator::from_handle(&self.state, self.state.world)
    }

    /// Get a handle to the communicator containing only this process.
    pub fn self_comm(&self) -> Communicator {
        Communicator::from_handle(&self.state, self.state.self_comm)
    }

    /// Universe-unique identity of this process.
    pub fn process_id(&self) -> ProcessId {
        self.state.pid
    }

    /// Seconds elapsed since this process started.
    pub fn wtime(&self) -> f64 {
        self.state.started.elapsed().as_secs_f64()
    }

    /// Resolution of [`wtime`](Self::wtime), in seconds.
    pub fn wtick(&self) -> f64 {
        1e-9
    }

    /// Version and subversion of the standard implemented.
    pub fn get_version() -> (i32, i32) {
        (VERSION, SUBVERSION)
    }

    /// Human-readable runtime version string.
    pub fn version() -> String {
        format!(
            "mpirt {} (standard {VERSION}.{SUBVERSION})",
            env!("CARGO_PKG_VERSION")
        )
    }

    /// Name of the host this process runs on.
    pub fn processor_name(&self) -> String {
        self.state.universe.config.hostname.clone()
    }

    /// Register a user reduction operator.
    ///
    /// `function(input, inout)` must store `input ∘ inout` into `inout`
    /// element-wise. Operators declared non-commutative are applied in rank
    /// order by [`Communicator::reduce`].
    pub fn op_create<T, F>(&self, commute: bool, function: F) -> Result<Op>
    where
        T: MpiDatatype,
        F: Fn(&[T], &mut [T]) + 'static,
    {
        Ok(self.state.ops.borrow_mut().create(commute, function))
    }

    /// Free a user operator. A reduction already holding the operator runs
    /// to completion.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOp`] for built-in operators and handles that are not
    /// live.
    pub fn op_free(&self, op: Op) -> Result<()> {
        let result = self.state.ops.borrow_mut().free(op);
        self.state.route(self.state.world_errors(), result)
    }

    /// Whether [`finalize`](Self::finalize) has completed on this process.
    pub fn is_finalized(&self) -> bool {
        self.state.is_finalized()
    }

    /// Shut this process down. Collective over the world communicator.
    pub fn finalize(self) -> Result<()> {
        self.world().barrier()?;
        self.state.mark_finalized();
        tracing::debug!(process = %self.state.pid, "finalized");
        Ok(())
    }

    /// Abort every process in the universe with `code`.
    pub fn abort(&self, code: i32) -> ! {
        self.state.abort(&Error::Aborted(code))
    }
}

impl std::fmt::Debug for Mpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpi")
            .field("process", &self.state.pid)
            .field("finalized", &self.state.is_finalized())
            .finish()
    }
}
