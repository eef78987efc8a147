//! Spawn a registered program under the hard and the soft policy.
//!
//! The universe is limited to 9 processes. Two parents first spawn 3
//! children exactly, then ask for 8 with `soft = 1:4` and get 4, the
//! largest count the soft range allows.
//!
//! Run with: cargo run --example test_spawn

use mpirt::{Config, Error, ErrorClass, Info, Mpi, Result, Universe};
use tracing_subscriber::EnvFilter;

fn worker(mpi: Mpi) -> Result<()> {
    let world = mpi.world();
    let parent = mpi
        .parent()
        .ok_or_else(|| Error::Internal("worker started without a parent".into()))?;

    // Every child reports its rank and argument count to parent rank 0.
    parent.send(&[world.rank(), mpi.args().len() as i32], 0, 1)?;
    parent.disconnect()
}

fn collect(inter: &mpirt::Communicator, children: i32) -> Result<()> {
    let mut seen = vec![false; children as usize];
    for _ in 0..children {
        let mut report = [0i32; 2];
        let status = inter.recv(&mut report, mpirt::ANY_SOURCE, 1)?;
        assert_eq!(status.source, report[0]);
        assert_eq!(report[1], 2, "children get both arguments");
        seen[report[0] as usize] = true;
    }
    assert!(seen.iter().all(|&s| s));
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()
        .expect("bad MPIRT_* environment")
        .with_universe_size(9);
    let universe = Universe::new(config);
    universe.register_program("worker", worker);

    universe
        .run(2, |mpi| {
            let world = mpi.world();
            let rank = world.rank();

            // ================================================================
            // Test 1: hard policy
            // ================================================================
            let spawned = world.spawn("worker", &["--mode", "hard"], 3, &Info::null(), 0)?;
            assert_eq!(spawned.errcodes, vec![0; 3]);
            assert_eq!(spawned.intercomm.remote_size()?, 3);
            if rank == 0 {
                collect(&spawned.intercomm, 3)?;
                println!("PASS: hard spawn of 3");
            }
            spawned.intercomm.disconnect()?;

            // ================================================================
            // Test 2: soft policy caps the count
            // ================================================================
            let mut info = Info::new();
            info.set("soft", "1:4")?;
            let spawned = world.spawn("worker", &["--mode", "soft"], 8, &info, 1)?;
            let started = spawned.errcodes.iter().filter(|&&c| c == 0).count();
            assert_eq!(started, 4);
            assert!(spawned.errcodes[4..]
                .iter()
                .all(|&c| c == ErrorClass::Spawn as i32));
            if rank == 0 {
                collect(&spawned.intercomm, 4)?;
                println!("PASS: soft spawn started {started} of 8");
            }
            spawned.intercomm.disconnect()?;

            world.barrier()?;
            if rank == 0 {
                println!("\nSpawn tests passed!");
            }
            Ok(())
        })
        .expect("test_spawn failed");
}
