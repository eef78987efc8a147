//! User-defined reduction operators: create, reduce, free.
//!
//! Run with: cargo run --example test_op_free -- 3

use mpirt::{Config, Error, ErrorMode, Op, Universe};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let np = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(3);
    let config = Config::from_env()
        .expect("bad MPIRT_* environment")
        .with_errors(ErrorMode::Return);

    Universe::new(config)
        .run(np, |mpi| {
            let world = mpi.world();
            let rank = world.rank();
            let size = world.size();

            // ================================================================
            // Test 1: a commutative user operator gives the plain sum
            // ================================================================
            let addem = mpi.op_create::<i32, _>(true, |input, inout| {
                for (x, y) in input.iter().zip(inout.iter_mut()) {
                    *y += *x;
                }
            })?;
            let mut total = [0i32];
            world.reduce(&[rank], &mut total, addem, 0)?;
            mpi.op_free(addem)?;
            world.broadcast(&mut total, 0)?;
            let expected = size * (size - 1) / 2;
            assert_eq!(total[0], expected, "rank {rank}: sum {}", total[0]);
            if rank == 0 {
                println!("PASS: user operator reduce, result {}", total[0]);
            }

            // ================================================================
            // Test 2: freed and built-in operators are rejected
            // ================================================================
            assert!(matches!(mpi.op_free(addem), Err(Error::InvalidOp(_))));
            assert!(matches!(mpi.op_free(Op::SUM), Err(Error::InvalidOp(_))));
            assert!(matches!(
                world.reduce(&[1], &mut total, addem, 0),
                Err(Error::InvalidOp(_))
            ));
            if rank == 0 {
                println!("PASS: freed and built-in operators cannot be freed again");
            }

            world.barrier()?;
            if rank == 0 {
                println!("\nAll operator tests passed!");
            }
            Ok(())
        })
        .expect("test_op_free failed");
}
