//! Hello World example - basic universe startup and communication.
//!
//! Run with: cargo run --example hello_world -- 4

use mpirt::{Config, Mpi, Result, Universe};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let np = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(4);
    let universe = Universe::new(Config::from_env()?);

    universe.run(np, |mpi| {
        // Get the world communicator
        let world = mpi.world();

        // Get our rank and the total number of processes
        let rank = world.rank();
        let size = world.size();

        let processor_name = world.processor_name()?;
        let (version, subversion) = Mpi::get_version();

        println!(
            "Hello from rank {} of {} on {} ({}, standard {}.{})",
            rank,
            size,
            processor_name,
            Mpi::version(),
            version,
            subversion
        );

        // Synchronize before exiting
        world.barrier()?;

        if rank == 0 {
            println!("\nAll processes reported in. Test passed!");
        }

        mpi.finalize()
    })
}
