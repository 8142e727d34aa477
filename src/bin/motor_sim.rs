// Motor simulator: one TCP endpoint per simulated GM6020
//
// Usage: cargo run --bin motor_sim -- --motors 2 --base-port 6000
// Motor N listens on base_port + N. Stop with Ctrl+C.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gm6020_runtime::config::{DEFAULT_BASE_PORT, DEFAULT_HOST};
use gm6020_runtime::sim::{MotorPhysics, SimServer};

#[derive(Debug, Parser)]
#[command(about = "Simulated GM6020 motors speaking the framed torque protocol")]
struct Args {
    /// Number of motors (IDs 0..N)
    #[arg(long, default_value_t = 1)]
    motors: u8,

    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Mechanical load level 0-9 (heavier rotor, more friction)
    #[arg(long, default_value_t = 5)]
    load_level: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let running = Arc::new(AtomicBool::new(true));
    let physics = MotorPhysics::from_load_level(args.load_level);
    info!(
        "Rotor: inertia {:.4} kg·m², damping {:.4}, static friction {:.4} N·m, load {:.4} N·m",
        physics.inertia, physics.damping, physics.static_friction, physics.load_torque
    );

    let mut servers = Vec::new();
    for id in 0..args.motors {
        let port = args
            .base_port
            .checked_add(u16::from(id))
            .ok_or("base port + motor id exceeds 65535")?;
        let server = SimServer::bind((args.host.as_str(), port), id, physics.clone())?;
        servers.push((id, server.spawn(Arc::clone(&running))?));
    }

    for (id, handle) in servers {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(motor_id = id, "Simulator failed: {}", e),
            Err(_) => error!(motor_id = id, "Simulator thread panicked"),
        }
    }
    Ok(())
}
