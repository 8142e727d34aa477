// Runtime orchestration: bring motors up, run the control loop, report telemetry
//
// The registry is built here and shared with the control loop; external
// tools read telemetry from the same handles and retune through SharedGains.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::config::{RuntimeConfig, TELEMETRY_HZ};
use crate::control::{ControlLoop, ControlLoopError, SharedGains};
use crate::messages::{MotorTelemetry, RuntimeHealth};
use crate::motor::{MotorId, MotorRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{} motor(s) failed to connect: {}", .0.len(), describe_failures(.0))]
    Connect(Vec<(MotorId, RegistryError)>),

    #[error(transparent)]
    ControlLoop(#[from] ControlLoopError),
}

fn describe_failures(failures: &[(MotorId, RegistryError)]) -> String {
    failures
        .iter()
        .map(|(_, e)| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<MotorRegistry>,
    control: ControlLoop,
    health: RuntimeHealth,
}

impl Runtime {
    /// Register the configured motors and prepare (but do not start) the loop
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let registry = Arc::new(MotorRegistry::new());
        for &id in &config.motor_ids {
            registry.register(id)?;
        }

        let gains = Arc::new(SharedGains::new(config.gains));
        let control = ControlLoop::new(
            Arc::clone(&registry),
            gains,
            config.setpoint,
            config.control_period(),
        )?;

        Ok(Self {
            config,
            registry,
            control,
            health: RuntimeHealth::Degraded, // Degraded until every link is up
        })
    }

    pub fn registry(&self) -> &Arc<MotorRegistry> {
        &self.registry
    }

    pub fn control(&self) -> &ControlLoop {
        &self.control
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Connect every motor, then start the control loop
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        self.registry
            .connect_all(&self.config.host, self.config.base_port)
            .map_err(RuntimeError::Connect)?;
        self.control.start()?;
        Ok(())
    }

    /// Sample every motor and update the health status
    pub fn sample(&mut self) -> Vec<MotorTelemetry> {
        let telemetry: Vec<MotorTelemetry> = self
            .registry
            .handles()
            .iter()
            .map(MotorTelemetry::from)
            .collect();

        let health = RuntimeHealth::from_telemetry(&telemetry);
        if health != self.health {
            match health {
                RuntimeHealth::Ok => info!("All motor links up"),
                RuntimeHealth::Degraded => warn!("Motor link lost, runtime degraded"),
            }
            self.health = health;
        }
        telemetry
    }

    /// Stop the control loop, then tear down every link
    pub fn shutdown(&mut self) {
        self.control.stop();
        self.registry.disconnect_all();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub async fn run(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(
        "Connecting {} motor(s) to {} from base port {}",
        config.motor_ids.len(),
        config.host,
        config.base_port
    );

    let mut runtime = Runtime::new(config)?;
    runtime.start()?;

    let mut tick = interval(Duration::from_millis(1000 / TELEMETRY_HZ));
    info!("Runtime started: {}Hz telemetry, Ctrl+C to stop", TELEMETRY_HZ);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutting down");
                break;
            }
            _ = tick.tick() => {
                let telemetry = runtime.sample();
                info!(
                    health = ?runtime.health(),
                    ticks = runtime.control().ticks(),
                    "telemetry {}",
                    serde_json::to_string(&telemetry)?
                );
            }
        }
    }

    // Joins worker threads; nothing else is scheduled on this runtime
    tokio::task::block_in_place(|| runtime.shutdown());
    Ok(())
}
