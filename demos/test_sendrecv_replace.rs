//! Pass a token around a ring with sendrecv_replace.
//!
//! Run with: cargo run --example test_sendrecv_replace -- 4

use mpirt::{Config, Universe};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let np = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(4);
    let config = Config::from_env().expect("bad MPIRT_* environment");

    Universe::new(config)
        .run(np, |mpi| {
            let world = mpi.world();
            let rank = world.rank();
            let size = world.size();
            let right = (rank + 1) % size;
            let left = (rank + size - 1) % size;

            // After `size` hops every token is back home.
            let mut token = vec![f64::from(rank); 8];
            for hop in 1..=size {
                let status = world.sendrecv_replace(&mut token, right, hop, left, hop)?;
                assert_eq!(status.source, left);
                let origin = (rank - hop).rem_euclid(size);
                assert!(
                    token.iter().all(|&v| v == f64::from(origin)),
                    "rank {rank}: hop {hop} carries {token:?}, expected {origin}"
                );
            }

            world.barrier()?;
            if rank == 0 {
                println!("PASS: token ring with sendrecv_replace");
            }
            Ok(())
        })
        .expect("test_sendrecv_replace failed");
}
