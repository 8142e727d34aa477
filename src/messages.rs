// Telemetry records published by the runtime

use serde::{Deserialize, Serialize};

use crate::motor::{MotorHandle, MotorId};

/// Watched state of one motor at a point in time
///
/// Fields are sampled one after another, so angle/omega and torque may come
/// from different control cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotorTelemetry {
    pub motor_id: MotorId,
    pub connected: bool,
    pub angle_deg: f32,
    pub omega: f32,
    pub torque: f32,
}

impl From<&MotorHandle> for MotorTelemetry {
    fn from(motor: &MotorHandle) -> Self {
        let state = motor.state();
        Self {
            motor_id: motor.id(),
            connected: motor.is_connected(),
            angle_deg: state.angle(),
            omega: state.omega(),
            torque: state.torque(),
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    /// At least one registered motor has lost its link
    Degraded,
}

impl RuntimeHealth {
    pub fn from_telemetry(motors: &[MotorTelemetry]) -> Self {
        if motors.iter().all(|m| m.connected) {
            RuntimeHealth::Ok
        } else {
            RuntimeHealth::Degraded
        }
    }
}
