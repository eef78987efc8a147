//! Spawning registered programs as new process groups.

use crate::collective;
use crate::comm::{CommView, Communicator};
use crate::datatype::{from_bytes, to_bytes};
use crate::error::{Error, ErrorClass, Result};
use crate::group::Group;
use crate::info::{Info, SpawnHints};
use crate::port::{adopt_link, share_link, Link};
use crate::process::{LaunchInfo, ProcessState};
use crate::Mpi;
use std::rc::Rc;

/// Outcome of [`Communicator::spawn`].
#[derive(Debug)]
pub struct SpawnResult {
    /// Intercommunicator with the spawning group as local group and the
    /// children as remote group.
    pub intercomm: Communicator,
    /// One code per requested process: `0` for a started process,
    /// [`ErrorClass::Spawn`] for a slot a soft spawn left empty.
    pub errcodes: Vec<i32>,
}

/// How many processes to start for a request of `maxprocs`, given the free
/// capacity of the universe.
fn spawn_count(maxprocs: usize, capacity: Option<usize>, hints: &SpawnHints) -> Result<usize> {
    let limit = capacity.map_or(maxprocs, |free| free.min(maxprocs));
    match &hints.soft {
        None if limit == maxprocs => Ok(maxprocs),
        None => Err(Error::SpawnFailed(format!(
            "{maxprocs} processes requested, only {limit} can be started"
        ))),
        Some(soft) => soft
            .largest_within(limit)
            .filter(|&count| count > 0)
            .ok_or_else(|| {
                Error::SpawnFailed(format!(
                    "no acceptable process count within {limit} of {maxprocs} requested"
                ))
            }),
    }
}

/// Root side of a spawn: start the children and describe them.
fn launch_children(
    state: &ProcessState,
    view: &CommView,
    command: &str,
    argv: &[&str],
    maxprocs: i32,
    info: &Info,
) -> Result<(Link, Vec<i32>)> {
    let universe = &state.universe;
    let requested = usize::try_from(maxprocs)
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| Error::InvalidArg(format!("maxprocs {maxprocs} is not positive")))?;
    let command = command.trim();
    let program = universe
        .program(command)
        .ok_or_else(|| Error::SpawnFailed(format!("no program registered as '{command}'")))?;
    let hints = SpawnHints::from_info(info)?;
    let count = spawn_count(requested, universe.capacity(), &hints)?;

    let context = universe.allocate_contexts(1);
    let launch = LaunchInfo {
        command: Some(command.to_string()),
        args: argv.iter().map(|a| a.to_string()).collect(),
        info: info.clone(),
    };
    let handles = universe
        .start_world(count, program, launch, Some((view.group.clone(), context)))
        .map_err(|err| match err {
            Error::ResourceExhausted(msg) => Error::SpawnFailed(msg),
            other => other,
        })?;
    let remote = Group::from_members(handles.iter().map(|(_, pid, _)| *pid).collect());
    universe.track_spawned(handles);
    tracing::debug!(
        process = %state.pid,
        command,
        requested,
        started = count,
        context = context.0,
        "spawned processes"
    );

    let mut errcodes = vec![0; count];
    errcodes.resize(requested, ErrorClass::Spawn as i32);
    Ok((Link { remote, context }, errcodes))
}

impl Communicator {
    /// Start up to `maxprocs` processes running the program registered as
    /// `command`. Collective; `command`, `argv`, `maxprocs` and `info` are
    /// only significant at `root`.
    ///
    /// By default exactly `maxprocs` processes are started or the call
    /// fails. An info `soft` key (`a`, `a:b` or `a:b:s` ranges, comma
    /// separated) lets the runtime start the largest acceptable count that
    /// fits the universe instead; the unused slots get
    /// [`ErrorClass::Spawn`] codes.
    ///
    /// # Errors
    ///
    /// [`Error::SpawnFailed`] for an unknown command or when no acceptable
    /// count fits. Nothing is started in that case.
    pub fn spawn(
        &self,
        command: &str,
        argv: &[&str],
        maxprocs: i32,
        info: &Info,
        root: i32,
    ) -> Result<SpawnResult> {
        self.guard(|state, view| {
            view.require_intra("spawn")?;
            view.check_root(root)?;
            let (outcome, errcodes) = if view.rank == root {
                match launch_children(state, view, command, argv, maxprocs, info) {
                    Ok((link, errcodes)) => (Some(Ok(link)), errcodes),
                    Err(err) => (Some(Err(err)), Vec::new()),
                }
            } else {
                (None, Vec::new())
            };
            let link = share_link(state, view, root, outcome)?;
            let errcodes: Vec<i32> =
                from_bytes(&collective::bcast_bytes(state, view, to_bytes(&errcodes), root)?);
            Ok(SpawnResult {
                intercomm: adopt_link(state, view, link, "SPAWN"),
                errcodes,
            })
        })
    }
}

impl Mpi {
    /// The intercommunicator to the spawning group, if this process was
    /// spawned and has not disconnected from its parents.
    pub fn parent(&self) -> Option<Communicator> {
        let state: &Rc<ProcessState> = self.state();
        let handle = state.parent?;
        let live = state.comms.borrow().get(handle).is_ok();
        live.then(|| Communicator::from_handle(state, handle))
    }

    /// Arguments passed to [`Communicator::spawn`]; empty for processes
    /// started by [`Universe::launch`](crate::Universe::launch).
    pub fn args(&self) -> &[String] {
        &self.state().launch.args
    }

    /// Name of the program this process was spawned as.
    pub fn command(&self) -> Option<&str> {
        self.state().launch.command.as_deref()
    }

    /// Info the spawning root passed.
    pub fn spawn_info(&self) -> &Info {
        &self.state().launch.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::SoftCounts;
    use crate::{Config, ErrorMode, Universe};

    fn sized(size: usize) -> Universe {
        Universe::new(
            Config::default()
                .with_errors(ErrorMode::Return)
                .with_universe_size(size),
        )
    }

    fn child(mpi: Mpi) -> Result<()> {
        let world = mpi.world();
        let parent = mpi
            .parent()
            .ok_or_else(|| Error::Internal("spawned without a parent".into()))?;
        assert_eq!(parent.get_name()?, "MPI_COMM_PARENT");
        assert_eq!(mpi.command(), Some("worker"));
        if world.rank() == 0 {
            let report = [world.size(), mpi.args().len() as i32];
            parent.send(&report, 0, 11)?;
        }
        parent.disconnect()?;
        assert!(mpi.parent().is_none());
        Ok(())
    }

    #[test]
    fn count_policies() {
        let hard = SpawnHints::default();
        assert_eq!(spawn_count(3, None, &hard).unwrap(), 3);
        assert_eq!(spawn_count(3, Some(5), &hard).unwrap(), 3);
        assert!(matches!(
            spawn_count(3, Some(2), &hard),
            Err(Error::SpawnFailed(_))
        ));
        let soft = SpawnHints {
            soft: Some(SoftCounts::parse("1,4:8:2").unwrap()),
            ..SpawnHints::default()
        };
        assert_eq!(spawn_count(8, Some(7), &soft).unwrap(), 6);
        assert_eq!(spawn_count(8, Some(3), &soft).unwrap(), 1);
        assert!(spawn_count(8, Some(0), &soft).is_err());
    }

    #[test]
    fn hard_spawn_starts_every_process() {
        let universe = sized(4);
        universe.register_program("worker", child);
        universe
            .run(2, |mpi| {
                let world = mpi.world();
                assert!(mpi.parent().is_none());
                let spawned = world.spawn("worker", &["-v", "x"], 2, &Info::null(), 0)?;
                assert_eq!(spawned.errcodes, vec![0, 0]);
                let inter = spawned.intercomm;
                assert_eq!((inter.size(), inter.remote_size()?), (2, 2));
                if world.rank() == 0 {
                    let mut report = [0i32; 2];
                    inter.recv(&mut report, 0, 11)?;
                    assert_eq!(report, [2, 2]);
                }
                inter.disconnect()
            })
            .unwrap();
        assert_eq!(universe.live_processes(), 0);
    }

    #[test]
    fn hard_spawn_fails_atomically() {
        let universe = sized(3);
        universe.register_program("worker", child);
        universe
            .run(2, |mpi| {
                let err = mpi
                    .world()
                    .spawn("worker", &[], 2, &Info::null(), 1)
                    .unwrap_err();
                assert!(matches!(err, Error::SpawnFailed(_)));
                let err = mpi
                    .world()
                    .spawn("missing", &[], 1, &Info::null(), 1)
                    .unwrap_err();
                assert!(matches!(err, Error::SpawnFailed(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn soft_spawn_fills_what_fits() {
        let universe = sized(4);
        universe.register_program("worker", child);
        universe
            .run(1, |mpi| {
                let mut info = Info::new();
                info.set("soft", "1:3")?;
                let spawned = mpi.world().spawn("worker", &[], 5, &info, 0)?;
                let spawn_code = ErrorClass::Spawn as i32;
                assert_eq!(spawned.errcodes, vec![0, 0, 0, spawn_code, spawn_code]);
                let inter = spawned.intercomm;
                assert_eq!(inter.remote_size()?, 3);
                let mut report = [0i32; 2];
                inter.recv(&mut report, 0, 11)?;
                assert_eq!(report, [3, 0]);
                inter.disconnect()
            })
            .unwrap();
    }
}
