//! Integration test for Info objects and their typed views.
//!
//! Exercises Info::new, Info::null, set/get/delete, key order, the
//! recognised-key table, and the SpawnHints and PortHints views.
//!
//! Run with: cargo run --example test_info -- 2

use mpirt::{Config, Error, Info, PortHints, SpawnHints, Universe};
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

            // ================================================================
            // Test 1: the null info object reads as empty, rejects set
            // ================================================================
            {
                let mut null_info = Info::null();
                assert!(null_info.is_null());
                assert_eq!(null_info.get("host"), None);
                assert!(matches!(null_info.set("k", "v"), Err(Error::InvalidInfo(_))));
                if rank == 0 {
                    println!("PASS: Test 1 — Info::null()");
                }
            }

            // ================================================================
            // Test 2: set, overwrite, delete, insertion order
            // ================================================================
            {
                let mut info = Info::new();
                info.set("key_a", "value_a")?;
                info.set("key_b", "value_b")?;
                info.set("key_c", "value_c")?;
                info.set("key_a", "updated")?;
                assert_eq!(info.get("key_a"), Some("updated"));
                assert_eq!(info.nkeys(), 3);
                assert_eq!(info.nth_key(0), Some("key_a"));
                info.delete("key_b")?;
                let keys: Vec<&str> = info.iter().map(|(k, _)| k).collect();
                assert_eq!(keys, ["key_a", "key_c"]);
                assert!(info.get("nonexistent_key").is_none());
                if rank == 0 {
                    println!("PASS: Test 2 — set/get/delete");
                }
            }

            // ================================================================
            // Test 3: unrecognised keys are kept but inert
            // ================================================================
            {
                let mut info = Info::new();
                info.set("my_private_key", "42")?;
                info.set("wdir", "/tmp")?;
                assert!(!Info::is_recognized("my_private_key"));
                assert!(Info::is_recognized("wdir"));
                let hints = SpawnHints::from_info(&info)?;
                assert_eq!(hints.wdir.as_deref(), Some("/tmp"));
                assert_eq!(info.get("my_private_key"), Some("42"));
                if rank == 0 {
                    println!("PASS: Test 3 — unrecognised keys preserved");
                }
            }

            // ================================================================
            // Test 4: typed views validate recognised values
            // ================================================================
            {
                let mut info = Info::new();
                info.set("soft", "1:4:2,8")?;
                info.set("env", "OMP_NUM_THREADS=2 LANG=C")?;
                let hints = SpawnHints::from_info(&info)?;
                let soft = hints.soft.expect("soft was set");
                assert!(soft.allows(3) && soft.allows(8) && !soft.allows(2));
                assert_eq!(hints.env.len(), 2);

                info.set("ip_port", "not-a-port")?;
                assert!(matches!(PortHints::from_info(&info), Err(Error::InvalidInfo(_))));
                info.set("ip_port", "7000")?;
                assert_eq!(PortHints::from_info(&info)?.ip_port, Some(7000));
                if rank == 0 {
                    println!("PASS: Test 4 — typed views");
                }
            }

            world.barrier()?;
            if rank == 0 {
                println!("\n========================================");
                println!("All info tests passed!");
                println!("========================================");
            }
            Ok(())
        })
        .expect("test_info failed");
}
