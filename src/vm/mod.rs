//! VM process supervision: vfkit command assembly, PID-file protocol, and
//! the process lifecycle supervisor.

pub mod command;
pub mod pidfile;
pub mod process;

pub use process::{PauseOutcome, VmSupervisor};
