use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gm6020_runtime::config::RuntimeConfig;
use gm6020_runtime::motor::MotorId;

/// Speed-control runtime for GM6020 motors over TCP
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host running the motor endpoints
    #[arg(long)]
    host: Option<String>,

    /// Motor N connects to base_port + N
    #[arg(long)]
    base_port: Option<u16>,

    /// Motor IDs to drive, e.g. --motors 0,1,2
    #[arg(long, value_delimiter = ',')]
    motors: Option<Vec<MotorId>>,

    /// Speed setpoint in rad/s
    #[arg(long, allow_negative_numbers = true)]
    setpoint: Option<f32>,

    #[arg(long)]
    kp: Option<f32>,

    #[arg(long)]
    ki: Option<f32>,

    #[arg(long)]
    kd: Option<f32>,

    /// Control loop period in microseconds
    #[arg(long)]
    period_us: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<RuntimeConfig, Box<dyn std::error::Error + Send + Sync>> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(base_port) = self.base_port {
            config.base_port = base_port;
        }
        if let Some(motors) = self.motors {
            config.motor_ids = motors;
        }
        if let Some(setpoint) = self.setpoint {
            config.setpoint = setpoint;
        }
        if let Some(kp) = self.kp {
            config.gains.kp = kp;
        }
        if let Some(ki) = self.ki {
            config.gains.ki = ki;
        }
        if let Some(kd) = self.kd {
            config.gains.kd = kd;
        }
        if let Some(period_us) = self.period_us {
            config.control_period_us = period_us;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    // Info by default; RUST_LOG=gm6020_runtime::motor=trace logs every command sent
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gm6020_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
