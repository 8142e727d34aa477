// PID speed controller
//
// Gains live in a set of independent atomic cells so an external editor can
// retune a running loop. Each field is read once per compute() call; a retune
// that touches several fields may be observed half-applied for one tick.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_INTEGRAL_MAX, DEFAULT_KD, DEFAULT_KI, DEFAULT_KP, DEFAULT_OUTPUT_MAX,
    DEFAULT_OUTPUT_MIN,
};
use crate::motor::AtomicF32;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PidError {
    #[error("Timestep must be positive and finite, got {0}")]
    InvalidTimestep(f32),

    #[error("Non-finite input: setpoint {setpoint}, measurement {measurement}")]
    NonFiniteInput { setpoint: f32, measurement: f32 },

    #[error("Output limits are inverted: min {min} > max {max}")]
    InvalidLimits { min: f32, max: f32 },
}

/// Plain-value controller tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub output_min: f32,
    pub output_max: f32,
    /// Bound on the absolute value of the integral term
    pub integral_max: f32,
}

impl Default for ControllerGains {
    fn default() -> Self {
        Self {
            kp: DEFAULT_KP,
            ki: DEFAULT_KI,
            kd: DEFAULT_KD,
            output_min: DEFAULT_OUTPUT_MIN,
            output_max: DEFAULT_OUTPUT_MAX,
            integral_max: DEFAULT_INTEGRAL_MAX,
        }
    }
}

/// Controller tuning that can be edited while the loop runs
#[derive(Debug)]
pub struct SharedGains {
    kp: AtomicF32,
    ki: AtomicF32,
    kd: AtomicF32,
    output_min: AtomicF32,
    output_max: AtomicF32,
    integral_max: AtomicF32,
}

impl SharedGains {
    pub fn new(gains: ControllerGains) -> Self {
        Self {
            kp: AtomicF32::new(gains.kp),
            ki: AtomicF32::new(gains.ki),
            kd: AtomicF32::new(gains.kd),
            output_min: AtomicF32::new(gains.output_min),
            output_max: AtomicF32::new(gains.output_max),
            integral_max: AtomicF32::new(gains.integral_max),
        }
    }

    pub fn set_gains(&self, kp: f32, ki: f32, kd: f32) {
        self.kp.store(kp, Ordering::Relaxed);
        self.ki.store(ki, Ordering::Relaxed);
        self.kd.store(kd, Ordering::Relaxed);
    }

    pub fn set_limits(&self, output_min: f32, output_max: f32) -> Result<(), PidError> {
        if output_min > output_max {
            return Err(PidError::InvalidLimits {
                min: output_min,
                max: output_max,
            });
        }
        self.output_min.store(output_min, Ordering::Relaxed);
        self.output_max.store(output_max, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_integral_max(&self, integral_max: f32) {
        self.integral_max.store(integral_max.abs(), Ordering::Relaxed);
    }

    /// Read every field (individually, not as one transaction)
    pub fn snapshot(&self) -> ControllerGains {
        ControllerGains {
            kp: self.kp.load(Ordering::Relaxed),
            ki: self.ki.load(Ordering::Relaxed),
            kd: self.kd.load(Ordering::Relaxed),
            output_min: self.output_min.load(Ordering::Relaxed),
            output_max: self.output_max.load(Ordering::Relaxed),
            integral_max: self.integral_max.load(Ordering::Relaxed),
        }
    }
}

impl Default for SharedGains {
    fn default() -> Self {
        Self::new(ControllerGains::default())
    }
}

// f32::clamp panics on inverted bounds, which a half-applied retune can produce
fn bound(value: f32, lo: f32, hi: f32) -> f32 {
    value.max(lo).min(hi)
}

/// PID controller with integral clamp
#[derive(Debug)]
pub struct PidController {
    gains: Arc<SharedGains>,
    integral: f32,
    last_error: f32,
}

impl PidController {
    pub fn new(gains: Arc<SharedGains>) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: 0.0,
        }
    }

    /// Controller with its own private tuning
    pub fn with_gains(gains: ControllerGains) -> Self {
        Self::new(Arc::new(SharedGains::new(gains)))
    }

    pub fn gains(&self) -> &Arc<SharedGains> {
        &self.gains
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// Compute the next output.
    ///
    /// # Arguments
    /// * `setpoint` - Desired value
    /// * `measurement` - Latest measured value
    /// * `dt` - Seconds since the previous call, must be > 0
    ///
    /// Non-finite inputs are rejected and leave the controller untouched.
    pub fn compute(&mut self, setpoint: f32, measurement: f32, dt: f32) -> Result<f32, PidError> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(PidError::InvalidTimestep(dt));
        }
        if !(setpoint.is_finite() && measurement.is_finite()) {
            return Err(PidError::NonFiniteInput { setpoint, measurement });
        }
        let g = self.gains.snapshot();
        let error = setpoint - measurement;

        let integral_max = g.integral_max.abs();
        self.integral = bound(self.integral + g.ki * error * dt, -integral_max, integral_max);

        let derivative = (error - self.last_error) / dt;
        self.last_error = error;

        let raw = g.kp * error + self.integral + g.kd * derivative;
        Ok(bound(raw, g.output_min, g.output_max))
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
    }
}
