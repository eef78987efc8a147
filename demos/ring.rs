//! Ring communication example - point-to-point communication.
//!
//! Each process sends data to the next process in a ring pattern.
//!
//! Run with: cargo run --example ring -- 4

use mpirt::{Config, Result, Universe};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let np = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(4);

    Universe::new(Config::from_env()?).run(np, |mpi| {
        let world = mpi.world();

        let rank = world.rank();
        let size = world.size();

        if size < 2 {
            if rank == 0 {
                eprintln!("This example requires at least 2 processes");
            }
            return Ok(());
        }

        // Calculate neighbors in the ring
        let next = (rank + 1) % size;
        let prev = (rank + size - 1) % size;

        let send_data = vec![rank as f64 * 100.0 + 1.0, rank as f64 * 100.0 + 2.0];
        let mut recv_data = vec![0.0; 2];

        println!("Rank {}: sending {:?} to rank {}", rank, send_data, next);

        // Sends are eager, so every rank can send first.
        world.send(&send_data, next, 0)?;
        let status = world.recv(&mut recv_data, prev, 0)?;
        println!(
            "Rank {}: received {:?} from rank {} (tag={}, count={})",
            rank, recv_data, status.source, status.tag, status.count
        );

        let expected = vec![prev as f64 * 100.0 + 1.0, prev as f64 * 100.0 + 2.0];
        assert_eq!(recv_data, expected, "Data mismatch!");

        world.barrier()?;

        if rank == 0 {
            println!("\nRing communication test passed!");
        }

        Ok(())
    })
}
