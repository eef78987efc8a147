//! Allgatherv partition law on a 10x10 table.
//!
//! Rank `r` owns a band of rows of the table. After the allgatherv every
//! rank must hold the whole table, each cell equal to the rank that owns
//! its row plus 10. The in-place variant is checked the same way.
//!
//! Run with: cargo run --example test_allgatherv -- 4

use mpirt::{Config, Universe};
use tracing_subscriber::EnvFilter;

const ROWS: i32 = 10;
const COLS: i32 = 10;

/// Rows assigned to each rank: the first `ROWS % size` ranks get one extra.
fn layout(size: i32) -> (Vec<i32>, Vec<i32>) {
    let base = ROWS / size;
    let extra = ROWS % size;
    let mut counts = Vec::new();
    let mut displs = Vec::new();
    let mut offset = 0;
    for r in 0..size {
        let rows = base + i32::from(r < extra);
        counts.push(rows * COLS);
        displs.push(offset);
        offset += rows * COLS;
    }
    (counts, displs)
}

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
            assert!(size <= ROWS, "at most {ROWS} processes, got {size}");

            let (counts, displs) = layout(size);
            let owner_of = |cell: i32| {
                (0..size)
                    .rev()
                    .find(|&r| displs[r as usize] <= cell)
                    .unwrap_or(0)
            };
            let mine = vec![rank + 10; counts[rank as usize] as usize];

            // ================================================================
            // Test 1: allgatherv from a separate send buffer
            // ================================================================
            let mut table = vec![-1i32; (ROWS * COLS) as usize];
            world.allgatherv(&mine, &mut table, &counts, &displs)?;
            for (cell, &value) in table.iter().enumerate() {
                let owner = owner_of(cell as i32);
                assert_eq!(
                    value,
                    owner + 10,
                    "rank {rank}: cell {cell} = {value}, expected {}",
                    owner + 10
                );
            }
            if rank == 0 {
                println!("PASS: allgatherv partition law");
            }

            // ================================================================
            // Test 2: in place
            // ================================================================
            let mut table = vec![-1i32; (ROWS * COLS) as usize];
            let start = displs[rank as usize] as usize;
            table[start..start + mine.len()].copy_from_slice(&mine);
            world.allgatherv_in_place(&mut table, &counts, &displs)?;
            assert!(table
                .iter()
                .enumerate()
                .all(|(cell, &v)| v == owner_of(cell as i32) + 10));
            if rank == 0 {
                println!("PASS: allgatherv in place");
            }

            world.barrier()?;
            if rank == 0 {
                println!("\nAll allgatherv tests passed!");
            }
            Ok(())
        })
        .expect("test_allgatherv failed");
}
