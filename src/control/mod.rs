// Speed control: PID law and the fixed-period loop that drives it

mod control_loop;
pub mod pid;

pub use control_loop::{ControlLoop, ControlLoopError};
pub use pid::{ControllerGains, PidController, PidError, SharedGains};
