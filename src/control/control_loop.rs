// Fixed-period speed control loop
//
// One thread. Each tick, for every connected motor: read omega, run that
// motor's PID against the shared setpoint, store the result as the torque
// command. Wake times come from an absolute accumulator on the monotonic
// clock, so per-tick jitter never adds up to drift.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::pid::{PidController, SharedGains};
use crate::motor::{AtomicF32, MotorHandle, MotorId, MotorRegistry};

#[derive(Debug, thiserror::Error)]
pub enum ControlLoopError {
    #[error("Control period must be non-zero")]
    InvalidPeriod,

    #[error("Failed to spawn control thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Counters published by the loop thread
#[derive(Debug, Default)]
struct LoopStats {
    ticks: AtomicU64,
    overruns: AtomicU64,
}

struct Slot {
    motor: MotorHandle,
    pid: PidController,
    active: bool,
}

/// One PID per registered motor.
///
/// A slot lives as long as its registration: slots for motors that left the
/// registry are dropped on the next tick, and a re-registered id gets a new
/// slot even if no tick ran in between.
struct ControllerBank {
    gains: Arc<SharedGains>,
    slots: BTreeMap<MotorId, Slot>,
}

impl ControllerBank {
    fn new(gains: Arc<SharedGains>) -> Self {
        Self {
            gains,
            slots: BTreeMap::new(),
        }
    }

    fn update(&mut self, registry: &MotorRegistry, setpoint: f32, dt: f32) {
        let gains = &self.gains;
        let slots = &mut self.slots;
        let mut seen = Vec::with_capacity(slots.len());

        registry.for_each(|motor| {
            seen.push(motor.id());
            let slot = slots.entry(motor.id()).or_insert_with(|| Slot {
                motor: motor.clone(),
                pid: PidController::new(Arc::clone(gains)),
                active: false,
            });
            if !slot.motor.same_registration(motor) {
                slot.motor = motor.clone();
                slot.active = false;
            }

            if !motor.is_connected() {
                slot.active = false;
                return;
            }
            if !slot.active {
                // Fresh link: do not carry integral state across a reconnect
                slot.pid.reset();
                slot.active = true;
                debug!(motor_id = motor.id(), "Motor joined control loop");
            }

            let state = motor.state();
            match slot.pid.compute(setpoint, state.omega(), dt) {
                Ok(torque) => state.set_torque(torque),
                Err(e) => warn!(motor_id = motor.id(), "PID rejected tick: {}", e),
            }
        });

        // for_each visits in ascending id order
        slots.retain(|id, _| seen.binary_search(id).is_ok());
    }

    #[cfg(test)]
    fn slot(&self, id: MotorId) -> Option<&Slot> {
        self.slots.get(&id)
    }
}

/// Periodic PID scheduler over a motor registry
pub struct ControlLoop {
    registry: Arc<MotorRegistry>,
    gains: Arc<SharedGains>,
    setpoint: Arc<AtomicF32>,
    period: Duration,
    running: Arc<AtomicBool>,
    stats: Arc<LoopStats>,
    handle: Option<JoinHandle<()>>,
}

impl ControlLoop {
    pub fn new(
        registry: Arc<MotorRegistry>,
        gains: Arc<SharedGains>,
        setpoint: f32,
        period: Duration,
    ) -> Result<Self, ControlLoopError> {
        if period.is_zero() {
            return Err(ControlLoopError::InvalidPeriod);
        }
        Ok(Self {
            registry,
            gains,
            setpoint: Arc::new(AtomicF32::new(setpoint)),
            period,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(LoopStats::default()),
            handle: None,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn gains(&self) -> &Arc<SharedGains> {
        &self.gains
    }

    /// Target angular velocity in rad/s
    pub fn setpoint(&self) -> f32 {
        self.setpoint.load(Ordering::Relaxed)
    }

    pub fn set_setpoint(&self, setpoint: f32) {
        self.setpoint.store(setpoint, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Completed ticks since construction
    pub fn ticks(&self) -> u64 {
        self.stats.ticks.load(Ordering::Relaxed)
    }

    /// Ticks that finished after their successor's wake time
    pub fn overruns(&self) -> u64 {
        self.stats.overruns.load(Ordering::Relaxed)
    }

    /// Spawn the loop thread. No-op if already running.
    pub fn start(&mut self) -> Result<(), ControlLoopError> {
        if self.handle.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        let registry = Arc::clone(&self.registry);
        let bank = ControllerBank::new(Arc::clone(&self.gains));
        let setpoint = Arc::clone(&self.setpoint);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let period = self.period;

        let spawned = thread::Builder::new()
            .name("control-loop".to_string())
            .spawn(move || run_loop(&registry, bank, &setpoint, &running, &stats, period));

        match spawned {
            Ok(handle) => {
                info!(
                    "Control loop started: {}us period, setpoint {} rad/s",
                    period.as_micros(),
                    self.setpoint()
                );
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Clear the running flag and join the thread. No-op if not running.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.running.store(false, Ordering::Release);
        if handle.join().is_err() {
            warn!("Control loop thread panicked");
        }
        info!(
            ticks = self.ticks(),
            overruns = self.overruns(),
            "Control loop stopped"
        );
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    registry: &MotorRegistry,
    mut bank: ControllerBank,
    setpoint: &AtomicF32,
    running: &AtomicBool,
    stats: &LoopStats,
    period: Duration,
) {
    let dt = period.as_secs_f32();
    let mut next_wake = Instant::now();

    while running.load(Ordering::Acquire) {
        bank.update(registry, setpoint.load(Ordering::Relaxed), dt);
        stats.ticks.fetch_add(1, Ordering::Relaxed);

        next_wake += period;
        let now = Instant::now();
        if now >= next_wake {
            // Late: skip the missed wake times instead of bursting to catch up
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            while next_wake <= now {
                next_wake += period;
            }
            trace!("Control tick overran its period");
        }
        thread::sleep(next_wake - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::pid::ControllerGains;

    fn make_loop(period: Duration) -> (Arc<MotorRegistry>, ControlLoop) {
        let registry = Arc::new(MotorRegistry::new());
        let gains = Arc::new(SharedGains::new(ControllerGains::default()));
        let control = ControlLoop::new(Arc::clone(&registry), gains, 5.0, period).unwrap();
        (registry, control)
    }

    #[test]
    fn test_zero_period_rejected() {
        let registry = Arc::new(MotorRegistry::new());
        let gains = Arc::new(SharedGains::default());
        assert!(matches!(
            ControlLoop::new(registry, gains, 0.0, Duration::ZERO),
            Err(ControlLoopError::InvalidPeriod)
        ));
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (_registry, mut control) = make_loop(Duration::from_millis(1));
        control.stop();
        assert!(!control.is_running());

        control.start().unwrap();
        control.start().unwrap();
        assert!(control.is_running());
        thread::sleep(Duration::from_millis(20));

        control.stop();
        control.stop();
        assert!(!control.is_running());
        let ticks = control.ticks();
        assert!(ticks > 0);

        // Thread is gone: the counter no longer moves
        thread::sleep(Duration::from_millis(10));
        assert_eq!(control.ticks(), ticks);
    }

    #[test]
    fn test_tick_rate_does_not_drift() {
        let (_registry, mut control) = make_loop(Duration::from_millis(2));
        let started = Instant::now();
        control.start().unwrap();
        thread::sleep(Duration::from_millis(400));
        control.stop();
        let elapsed = started.elapsed().as_secs_f64();

        let expected = elapsed / 0.002;
        let ticks = control.ticks() as f64;
        println!("ticks={} expected~{:.0} overruns={}", ticks, expected, control.overruns());
        // A relative-sleep loop loses a little every tick; the accumulator
        // must stay close to the ideal count.
        assert!(ticks <= expected + 2.0, "too many ticks: {}", ticks);
        assert!(ticks >= expected * 0.8, "too few ticks: {}", ticks);
    }

    #[test]
    fn test_unconnected_motor_is_skipped() {
        let registry = MotorRegistry::new();
        let handle = registry.register(0).unwrap();
        handle.state().record_feedback(0.0, 0.0);

        let mut bank = ControllerBank::new(Arc::new(SharedGains::default()));
        bank.update(&registry, 5.0, 0.001);
        assert_eq!(handle.state().torque(), 0.0);
    }

    fn integrating_bank() -> ControllerBank {
        ControllerBank::new(Arc::new(SharedGains::new(ControllerGains {
            kp: 0.0,
            ki: 10.0,
            kd: 0.0,
            output_min: -10.0,
            output_max: 10.0,
            integral_max: 1.0,
        })))
    }

    #[test]
    fn test_rejoin_resets_controller() {
        // Connections sit in the backlog; nothing needs to accept them
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let registry = MotorRegistry::new();
        registry.register(0).unwrap();
        registry.connect(0, "127.0.0.1", port).unwrap();

        let mut bank = integrating_bank();
        // error 5, ki 10, dt 0.01: integral grows 0.5 per tick up to 1.0
        bank.update(&registry, 5.0, 0.01);
        bank.update(&registry, 5.0, 0.01);
        assert!((bank.slot(0).unwrap().pid.integral() - 1.0).abs() < 1e-6);

        // Same id comes back between two ticks
        registry.deregister(0).unwrap();
        let fresh = registry.register(0).unwrap();
        registry.connect(0, "127.0.0.1", port).unwrap();

        bank.update(&registry, 5.0, 0.01);
        let integral = bank.slot(0).unwrap().pid.integral();
        assert!((integral - 0.5).abs() < 1e-6, "integral carried over: {}", integral);
        assert!((fresh.state().torque() - 0.5).abs() < 1e-6);

        // Reconnect of the same registration also starts from zero
        registry.disconnect(0).unwrap();
        bank.update(&registry, 5.0, 0.01);
        assert!(!bank.slot(0).unwrap().active);
        registry.connect(0, "127.0.0.1", port).unwrap();
        bank.update(&registry, 5.0, 0.01);
        assert!((bank.slot(0).unwrap().pid.integral() - 0.5).abs() < 1e-6);

        registry.disconnect_all();
    }

    #[test]
    fn test_departed_motor_slot_dropped() {
        let registry = MotorRegistry::new();
        registry.register(1).unwrap();
        registry.register(2).unwrap();

        let mut bank = integrating_bank();
        bank.update(&registry, 5.0, 0.01);
        assert!(bank.slot(1).is_some() && bank.slot(2).is_some());

        registry.deregister(1).unwrap();
        bank.update(&registry, 5.0, 0.01);
        assert!(bank.slot(1).is_none());
        assert!(bank.slot(2).is_some());
    }

    #[test]
    fn test_setpoint_is_shared() {
        let (_registry, control) = make_loop(Duration::from_millis(1));
        assert_eq!(control.setpoint(), 5.0);
        control.set_setpoint(-2.5);
        assert_eq!(control.setpoint(), -2.5);
    }
}
