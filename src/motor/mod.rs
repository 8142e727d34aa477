// Motor link module for GM6020-style torque-controlled motors
//
// Provides:
// - Framed wire protocol (command/feedback codec with resync)
// - Per-motor shared state
// - TCP transport session (sender + receiver threads)
// - Registry of motors keyed by ID

pub mod protocol;
mod registry;
mod session;
mod state;

pub use protocol::{CommandFrame, FeedbackFrame, FrameBuffer, MotorId};
pub use registry::{MotorHandle, MotorRegistry, RegistryError};
pub use session::{LinkStatus, SessionError, TransportSession};
pub use state::{AtomicF32, MotorState};
