//! Communicator names: defaults, set/get, truncation.
//!
//! Run with: cargo run --example test_comm_names -- 2

use mpirt::{Config, Universe, MAX_OBJECT_NAME};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let np = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(2);
    let config = Config::from_env().expect("bad MPIRT_* environment");

    Universe::new(config)
        .run(np, |mpi| {
            let world = mpi.world();
            let rank = world.rank();

            assert_eq!(world.get_name()?, "MPI_COMM_WORLD");
            assert_eq!(mpi.self_comm().get_name()?, "MPI_COMM_SELF");
            if rank == 0 {
                println!("PASS: default names");
            }

            let dup = world.duplicate()?;
            let system = dup.get_name()?;
            assert!(system.starts_with("MPI COMMUNICATOR"), "got '{system}'");
            dup.set_name(&format!("comm-{rank}"))?;
            assert_eq!(dup.get_name()?, format!("comm-{rank}"));
            if rank == 0 {
                println!("PASS: system name '{system}' replaced by a local name");
            }

            let long = "n".repeat(2 * MAX_OBJECT_NAME);
            dup.set_name(&long)?;
            assert_eq!(dup.get_name()?.len(), MAX_OBJECT_NAME - 1);
            dup.set_name("padded   ")?;
            assert_eq!(dup.get_name()?, "padded");
            if rank == 0 {
                println!("PASS: long names truncated, trailing spaces dropped");
            }

            dup.free()?;
            world.barrier()?;
            if rank == 0 {
                println!("\nAll naming tests passed!");
            }
            Ok(())
        })
        .expect("test_comm_names failed");
}
