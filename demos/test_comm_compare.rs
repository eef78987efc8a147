//! Communicator comparison: identical, congruent, similar, unequal.
//!
//! Run with: cargo run --example test_comm_compare -- 4

use mpirt::{Communicator, CommunicatorRelation, Config, Error, ErrorMode, Universe};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let np = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(4);
    let config = Config::from_env()
        .expect("bad MPIRT_* environment")
        .with_errors(ErrorMode::Return);

    Universe::new(config)
        .run(np, |mpi| {
            let world = mpi.world();
            let rank = world.rank();
            assert!(world.size() >= 2, "needs at least 2 processes");

            let dup = world.duplicate()?;
            let reversed = world.split(0, -rank)?.expect("color 0 is defined");

            let cases = [
                ("world vs world", world.compare(&mpi.world())?, CommunicatorRelation::Identical),
                ("world vs dup", world.compare(&dup)?, CommunicatorRelation::Congruent),
                ("world vs reversed", world.compare(&reversed)?, CommunicatorRelation::Similar),
                ("world vs self", world.compare(&mpi.self_comm())?, CommunicatorRelation::Unequal),
            ];
            for (what, got, expected) in cases {
                assert_eq!(got, expected, "rank {rank}: {what}");
                if rank == 0 {
                    println!("PASS: {what} is {got:?}");
                }
            }

            assert!(matches!(
                world.compare(&Communicator::null()),
                Err(Error::InvalidCommunicator(_))
            ));
            if rank == 0 {
                println!("PASS: null communicator is rejected");
            }

            dup.free()?;
            world.barrier()?;
            if rank == 0 {
                println!("\nAll comparison tests passed!");
            }
            Ok(())
        })
        .expect("test_comm_compare failed");
}
