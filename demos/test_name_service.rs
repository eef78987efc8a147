//! Name service round trip: publish, lookup, unpublish.
//!
//! Run with: cargo run --example test_name_service -- 3

use mpirt::{Config, Error, ErrorMode, Info, Universe};
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "MyTest";
const PORT: &str = "otherhost:122";

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
            let info = Info::null();

            if rank == 0 {
                mpi.publish_name(SERVICE, &info, PORT)?;
                assert!(matches!(
                    mpi.publish_name(SERVICE, &info, "elsewhere:1"),
                    Err(Error::InvalidArg(_))
                ));
            }
            world.barrier()?;

            let found = mpi.lookup_name(SERVICE, &info)?;
            assert_eq!(found, PORT, "rank {rank}: lookup returned '{found}'");
            if rank == 0 {
                println!("PASS: lookup after publish");
            }
            world.barrier()?;

            if rank == 0 {
                mpi.unpublish_name(SERVICE, &info, PORT)?;
            }
            world.barrier()?;

            assert!(matches!(
                mpi.lookup_name(SERVICE, &info),
                Err(Error::ServiceNotFound(_))
            ));
            if rank == 0 {
                assert!(matches!(
                    mpi.unpublish_name(SERVICE, &info, PORT),
                    Err(Error::ServiceNotFound(_))
                ));
                println!("PASS: lookup and unpublish fail after unpublish");
                println!("\nName service test passed!");
            }
            Ok(())
        })
        .expect("test_name_service failed");
}
