//! Cartesian shifts on periodic and non-periodic grids, and sub-grids.
//!
//! Run with: cargo run --example test_cart_shift -- 6

use mpirt::{dims_create, CommunicatorRelation, Config, PROC_NULL, Universe};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let np = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(6);
    let config = Config::from_env().expect("bad MPIRT_* environment");

    Universe::new(config)
        .run(np, |mpi| {
            let world = mpi.world();
            let rank = world.rank();
            let size = world.size();

            // ================================================================
            // Test 1: one-dimensional ring and line
            // ================================================================
            for periodic in [true, false] {
                let grid = world
                    .cart_create(&[size], &[periodic], false)?
                    .expect("every rank fits a 1-d grid");
                for disp in [1, -1, 2] {
                    let (source, dest) = grid.cart_shift(0, disp)?;
                    let step = |d: i32| {
                        let r = rank + d;
                        if periodic {
                            r.rem_euclid(size)
                        } else if (0..size).contains(&r) {
                            r
                        } else {
                            PROC_NULL
                        }
                    };
                    assert_eq!(
                        (source, dest),
                        (step(-disp), step(disp)),
                        "rank {rank}: periodic={periodic} disp={disp}"
                    );
                }
                assert_eq!(grid.cart_shift(0, 0)?, (rank, rank));
            }
            if rank == 0 {
                println!("PASS: periodic and non-periodic shifts");
            }

            // ================================================================
            // Test 2: balanced 2-d grid, coordinates and sub-grids
            // ================================================================
            let mut dims = [0, 0];
            dims_create(size, &mut dims)?;
            let grid = world
                .cart_create(&dims, &[true, false], true)?
                .expect("grid covers every rank");
            let layout = grid.cart_get()?;
            assert_eq!(grid.cart_rank(&layout.coords)?, grid.rank());
            let rows = grid.cart_sub(&[false, true])?;
            assert_eq!(rows.size(), dims[1]);
            let alone = grid.cart_sub(&[false, false])?;
            assert_eq!(alone.size(), 1);
            assert_eq!(alone.compare(&mpi.self_comm())?, CommunicatorRelation::Congruent);
            if rank == 0 {
                println!("PASS: {}x{} grid, sub-grids", dims[0], dims[1]);
            }

            world.barrier()?;
            if rank == 0 {
                println!("\nAll Cartesian tests passed!");
            }
            Ok(())
        })
        .expect("test_cart_shift failed");
}
