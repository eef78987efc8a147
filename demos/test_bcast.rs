//! Broadcast conformance: every root, payloads of 100, 65536 and 131072
//! ints.
//!
//! Run with: cargo run --example test_bcast -- 4

use mpirt::{Config, Universe};
use tracing_subscriber::EnvFilter;

const SIZES: [usize; 3] = [100, 65536, 131072];

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

            for &len in &SIZES {
                for root in 0..size {
                    let expected: Vec<i32> = (0..len as i32).map(|i| i * 3 + root).collect();
                    let mut buf = if rank == root {
                        expected.clone()
                    } else {
                        vec![-1; len]
                    };
                    world.broadcast(&mut buf, root)?;
                    if let Some(i) = buf.iter().zip(&expected).position(|(a, b)| a != b) {
                        panic!(
                            "rank {rank}: len {len} root {root}: buf[{i}] = {}, expected {}",
                            buf[i], expected[i]
                        );
                    }
                }
                if rank == 0 {
                    println!("PASS: broadcast of {len} ints from every root");
                }
            }

            world.barrier()?;
            if rank == 0 {
                println!("\n========================================");
                println!("All broadcast tests passed!");
                println!("========================================");
            }
            Ok(())
        })
        .expect("test_bcast failed");
}
