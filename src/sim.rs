// Simulated GM6020 motor on the far end of the link
//
// MotorPhysics is a single rotating mass with viscous damping, Coulomb
// friction, static friction and a constant load. SimServer exposes one
// simulated motor over TCP using the same wire protocol as real hardware:
// it consumes command frames and answers with feedback frames.

use std::f32::consts::TAU;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::motor::protocol::{CommandFrame, FeedbackFrame, FrameBuffer, MotorId};

/// Physics step and feedback interval of the simulator
pub const SIM_STEP: Duration = Duration::from_millis(10);

// Below this speed the rotor is treated as stationary
const STANDSTILL_OMEGA: f32 = 0.01;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

fn wrap_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU { 0.0 } else { wrapped }
}

/// Rigid rotor model
#[derive(Debug, Clone, PartialEq)]
pub struct MotorPhysics {
    /// kg·m²
    pub inertia: f32,
    /// N·m·s/rad
    pub damping: f32,
    /// N·m
    pub static_friction: f32,
    /// N·m, always opposing motion
    pub load_torque: f32,

    pub torque_input: f32,
    /// rad/s
    pub omega: f32,
    /// rad, in [0, 2π)
    pub angle: f32,
}

impl MotorPhysics {
    pub fn new(inertia: f32, damping: f32, static_friction: f32, load_torque: f32) -> Self {
        Self {
            inertia,
            damping,
            static_friction,
            load_torque,
            torque_input: 0.0,
            omega: 0.0,
            angle: 0.0,
        }
    }

    /// Parameters scaled by a load level in 0..=9 (0.4x to 1.3x load factor)
    pub fn from_load_level(level: u8) -> Self {
        let level = level.min(9);
        let load_factor = 0.5 + (f32::from(level) - 1.0) / 10.0;
        Self::new(
            0.005 + 0.005 * load_factor * load_factor,
            0.001 + 0.001 * load_factor,
            0.03 + 0.02 * load_factor,
            0.01 * load_factor,
        )
    }

    /// Angle in degrees, as reported on the wire
    pub fn angle_deg(&self) -> f32 {
        self.angle.to_degrees()
    }

    /// Advance the model by `dt` seconds
    pub fn step(&mut self, dt: f32) {
        let friction = if self.omega.abs() < STANDSTILL_OMEGA
            && self.torque_input.abs() <= self.static_friction
        {
            // Stuck: friction cancels the input exactly
            self.omega = 0.0;
            -self.torque_input
        } else {
            -self.omega.signum() * self.static_friction
        };

        let load = if self.omega != 0.0 {
            self.load_torque * self.omega.signum()
        } else {
            0.0
        };

        let total = self.torque_input - load - self.damping * self.omega + friction;
        let accel = total / self.inertia;

        let previous = self.omega;
        self.omega += accel * dt;
        // Trapezoidal integration of the angle
        self.angle = wrap_angle(self.angle + (previous + self.omega) * 0.5 * dt);
    }
}

impl Default for MotorPhysics {
    fn default() -> Self {
        Self::from_load_level(5)
    }
}

/// TCP endpoint for one simulated motor
pub struct SimServer {
    listener: TcpListener,
    motor_id: MotorId,
    physics: MotorPhysics,
    step: Duration,
}

impl SimServer {
    pub fn bind(addr: impl ToSocketAddrs, motor_id: MotorId, physics: MotorPhysics) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            motor_id,
            physics,
            step: SIM_STEP,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients one at a time until `running` is cleared.
    ///
    /// The rotor state carries over from one client to the next.
    pub fn serve(mut self, running: &AtomicBool) -> io::Result<()> {
        info!(motor_id = self.motor_id, addr = ?self.listener.local_addr(), "Simulator listening");

        while running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(motor_id = self.motor_id, %peer, "Client connected");
                    if let Err(e) = self.serve_client(stream, running) {
                        warn!(motor_id = self.motor_id, "Client session ended: {}", e);
                    } else {
                        info!(motor_id = self.motor_id, %peer, "Client disconnected");
                    }
                    // Unpowered between clients
                    self.physics.torque_input = 0.0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run `serve` on its own thread
    pub fn spawn(self, running: Arc<AtomicBool>) -> io::Result<thread::JoinHandle<io::Result<()>>> {
        thread::Builder::new()
            .name(format!("sim-motor{}", self.motor_id))
            .spawn(move || self.serve(&running))
    }

    fn serve_client(&mut self, mut stream: TcpStream, running: &AtomicBool) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let mut rx = FrameBuffer::<CommandFrame>::new();
        let mut chunk = [0u8; 256];
        let mut last_step = Instant::now();
        let mut next_step = last_step + self.step;

        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next_step {
                stream.set_read_timeout(Some(next_step - now))?;
                match stream.read(&mut chunk) {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        for cmd in rx.push(&chunk[..n]) {
                            if cmd.motor_id == self.motor_id {
                                trace!(motor_id = self.motor_id, torque = cmd.torque, "Command");
                                self.physics.torque_input = cmd.torque;
                            }
                        }
                        continue;
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock
                                | io::ErrorKind::TimedOut
                                | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => return Err(e),
                }
            }

            let now = Instant::now();
            if now >= next_step {
                self.physics.step((now - last_step).as_secs_f32());
                last_step = now;
                next_step += self.step;
                if next_step <= now {
                    next_step = now + self.step;
                }

                let feedback =
                    FeedbackFrame::new(self.motor_id, self.physics.angle_deg(), self.physics.omega);
                stream.write_all(&feedback.encode())?;
            }
        }
        debug!(motor_id = self.motor_id, discarded = rx.discarded(), "Simulator session stopped");
        Ok(())
    }
}
