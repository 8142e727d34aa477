// Link timing, control defaults, and the runtime configuration file
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::ControllerGains;
use crate::motor::MotorId;

// Default simulator endpoint; motor N listens on DEFAULT_BASE_PORT + N
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_BASE_PORT: u16 = 6000;

// Command transmit interval of each sender thread
pub const SEND_INTERVAL: Duration = Duration::from_millis(10);

// Control loop period
pub const CONTROL_PERIOD: Duration = Duration::from_millis(1);

// Telemetry report rate of the runtime
pub const TELEMETRY_HZ: u64 = 10;

// Speed setpoint in rad/s
pub const DEFAULT_SETPOINT: f32 = 5.0;

// Speed controller tuning
pub const DEFAULT_KP: f32 = 0.4;
pub const DEFAULT_KI: f32 = 0.02;
pub const DEFAULT_KD: f32 = 0.0;
pub const DEFAULT_OUTPUT_MIN: f32 = -10.0;
pub const DEFAULT_OUTPUT_MAX: f32 = 10.0;
pub const DEFAULT_INTEGRAL_MAX: f32 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Everything the runtime needs to bring the motors up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host: String,
    pub base_port: u16,
    pub motor_ids: Vec<MotorId>,
    /// Target angular velocity in rad/s
    pub setpoint: f32,
    pub control_period_us: u64,
    pub gains: ControllerGains,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            base_port: DEFAULT_BASE_PORT,
            motor_ids: vec![0],
            setpoint: DEFAULT_SETPOINT,
            control_period_us: CONTROL_PERIOD.as_micros() as u64,
            gains: ControllerGains::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_micros(self.control_period_us)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.motor_ids.is_empty() {
            return Err(ConfigError::Invalid("no motors configured".to_string()));
        }
        let unique: BTreeSet<_> = self.motor_ids.iter().collect();
        if unique.len() != self.motor_ids.len() {
            return Err(ConfigError::Invalid(format!(
                "duplicate motor ids in {:?}",
                self.motor_ids
            )));
        }
        if let Some(&max_id) = self.motor_ids.iter().max()
            && self.base_port.checked_add(u16::from(max_id)).is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "base port {} + motor {} exceeds 65535",
                self.base_port, max_id
            )));
        }
        if self.control_period_us == 0 {
            return Err(ConfigError::Invalid("control period must be non-zero".to_string()));
        }
        if self.gains.output_min > self.gains.output_max {
            return Err(ConfigError::Invalid(format!(
                "output_min {} > output_max {}",
                self.gains.output_min, self.gains.output_max
            )));
        }
        Ok(())
    }
}
