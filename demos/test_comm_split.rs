//! Communicator construction: split, create, duplicate, free.
//!
//! Exercises Communicator::split() by color and key, opting out with
//! UNDEFINED, Communicator::create() from a sub-group, and collectives
//! inside the new communicators.
//!
//! Run with: cargo run --example test_comm_split -- 4

use mpirt::{Config, ReduceOp, Universe, UNDEFINED};
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
            assert!(size >= 4, "test_comm_split requires at least 4 processes, got {size}");

            // ================================================================
            // Test 1: even/odd split, allreduce inside
            // ================================================================
            {
                let color = rank % 2;
                let sub = world.split(color, rank)?.expect("color is defined");
                assert_eq!(sub.rank(), rank / 2, "rank {rank}: sub rank");
                let expected_size = if color == 0 { (size + 1) / 2 } else { size / 2 };
                assert_eq!(sub.size(), expected_size, "rank {rank}: sub size");

                let sum = sub.allreduce_scalar(rank as f64, ReduceOp::Sum)?;
                let expected: f64 = (0..size).filter(|r| r % 2 == color).map(f64::from).sum();
                assert!((sum - expected).abs() < 1e-10, "rank {rank}: sum {sum}");
                if rank == 0 {
                    println!("PASS: even/odd split");
                }
            }

            // ================================================================
            // Test 2: keys reorder, UNDEFINED opts out
            // ================================================================
            {
                let color = if rank == 0 { UNDEFINED } else { 1 };
                let result = world.split(color, size - rank)?;
                if rank == 0 {
                    assert!(result.is_none(), "UNDEFINED color yields no communicator");
                    println!("PASS: split with UNDEFINED color");
                } else {
                    let sub = result.expect("defined color");
                    assert_eq!(sub.size(), size - 1);
                    assert_eq!(sub.rank(), size - 1 - rank, "descending keys reverse order");
                }
            }

            // ================================================================
            // Test 3: create from a sub-group, broadcast inside
            // ================================================================
            {
                let firsts = world.group()?.include(&[0, 1])?;
                let pair = world.create(&firsts)?;
                match pair {
                    Some(pair) => {
                        let mut data = vec![0i64; 5];
                        if pair.rank() == 0 {
                            data.fill(77);
                        }
                        pair.broadcast(&mut data, 0)?;
                        assert_eq!(data, vec![77; 5]);
                        assert!(pair.get_name()?.contains("CREATE FROM"));
                    }
                    None => assert!(rank >= 2),
                }
                if rank == 0 {
                    println!("PASS: create from sub-group");
                }
            }

            // ================================================================
            // Test 4: duplicate and free
            // ================================================================
            {
                let dup = world.duplicate()?;
                assert_eq!((dup.rank(), dup.size()), (rank, size));
                let sum = dup.allreduce_scalar(1i32, ReduceOp::Sum)?;
                assert_eq!(sum, size);
                dup.free()?;
                if rank == 0 {
                    println!("PASS: duplicate communicator");
                }
            }

            world.barrier()?;
            if rank == 0 {
                println!("\n========================================");
                println!("All comm split tests passed! (4 tests)");
                println!("========================================");
            }
            Ok(())
        })
        .expect("test_comm_split failed");
}
