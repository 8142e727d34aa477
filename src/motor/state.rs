// Per-motor shared scalars
//
// Each field is its own atomic cell. Readers get the latest value of every
// field individually; there is no snapshot spanning several fields.

use std::sync::atomic::{AtomicU32, Ordering};

use super::protocol::MotorId;

/// Atomic f32 wrapper using AtomicU32 with bit reinterpretation
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(val: f32) -> Self {
        Self(AtomicU32::new(val.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    pub fn store(&self, val: f32, order: Ordering) {
        self.0.store(val.to_bits(), order);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Shared command/telemetry state for one motor
#[derive(Debug)]
pub struct MotorState {
    id: MotorId,
    torque_command: AtomicF32,
    angle: AtomicF32,
    omega: AtomicF32,
}

impl MotorState {
    pub fn new(id: MotorId) -> Self {
        Self {
            id,
            torque_command: AtomicF32::default(),
            angle: AtomicF32::default(),
            omega: AtomicF32::default(),
        }
    }

    pub fn id(&self) -> MotorId {
        self.id
    }

    /// Torque (Nm) the sender thread will transmit next
    pub fn torque(&self) -> f32 {
        self.torque_command.load(Ordering::Relaxed)
    }

    pub fn set_torque(&self, torque: f32) {
        self.torque_command.store(torque, Ordering::Relaxed);
    }

    /// Last reported rotor angle in degrees
    pub fn angle(&self) -> f32 {
        self.angle.load(Ordering::Relaxed)
    }

    /// Last reported angular velocity in rad/s
    pub fn omega(&self) -> f32 {
        self.omega.load(Ordering::Relaxed)
    }

    /// Store one feedback sample. Values stay in place after a disconnect.
    pub fn record_feedback(&self, angle: f32, omega: f32) {
        self.angle.store(angle, Ordering::Relaxed);
        self.omega.store(omega, Ordering::Relaxed);
    }
}
