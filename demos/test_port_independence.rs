//! Rendezvous on two ports must not block each other.
//!
//! A coordinator opens ports A and B and hands A to peer 1 and B to peer 2.
//! Peer 1 connects to A at once; peer 2 waits before connecting to B. The
//! coordinator accepts on B first, and that accept must complete with
//! peer 2, unaffected by peer 1 already waiting on A.
//!
//! Run with: cargo run --example test_port_independence

use mpirt::{Communicator, Config, Info, Result, Universe};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const DELAY: Duration = Duration::from_millis(200);

fn send_port(world: &Communicator, port: &str, dest: i32) -> Result<()> {
    world.send(port.as_bytes(), dest, 0)
}

fn recv_port(world: &Communicator) -> Result<String> {
    let status = world.probe::<u8>(0, 0)?;
    let mut buf = vec![0u8; status.count as usize];
    world.recv(&mut buf, 0, 0)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().expect("bad MPIRT_* environment");

    Universe::new(config)
        .run(3, |mpi| {
            let world = mpi.world();
            let me = mpi.self_comm();
            let info = Info::null();

            if world.rank() == 0 {
                let port_a = mpi.open_port(&info)?;
                let port_b = mpi.open_port(&info)?;
                send_port(&world, &port_a, 1)?;
                send_port(&world, &port_b, 2)?;

                let start = Instant::now();
                let from_b = me.accept(&port_b, &info, 0)?;
                let waited = start.elapsed();
                let from_a = me.accept(&port_a, &info, 0)?;

                let mut who = [0i32];
                from_b.recv(&mut who, 0, 1)?;
                assert_eq!(who[0], 2, "accept on B matched peer {}", who[0]);
                from_a.recv(&mut who, 0, 1)?;
                assert_eq!(who[0], 1, "accept on A matched peer {}", who[0]);
                assert!(
                    waited >= DELAY / 2,
                    "accept on B returned after {waited:?}, before peer 2 connected"
                );
                println!("PASS: accept(B) matched peer 2 after {waited:?}");

                from_a.disconnect()?;
                from_b.disconnect()?;
                mpi.close_port(&port_a)?;
                mpi.close_port(&port_b)?;
                println!("\nPort independence test passed!");
            } else {
                let port = recv_port(&world)?;
                if world.rank() == 2 {
                    std::thread::sleep(DELAY);
                }
                let coordinator = me.connect(&port, &info, 0)?;
                coordinator.send(&[world.rank()], 0, 1)?;
                coordinator.disconnect()?;
            }
            Ok(())
        })
        .expect("test_port_independence failed");
}
