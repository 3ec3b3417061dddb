//! Agent process handles and launchers.
//!
//! [`AgentProcess`] is the opaque handle the rest of the daemon works with:
//! line-oriented stdin/stdout, a graceful interrupt, a hard terminate and an
//! observable exit. [`ChildProcess`] backs it with a tokio child process and
//! [`CliLauncher`] knows how to start the agent CLI in server or direct mode.

mod child;
mod launcher;
mod types;

pub use child::ChildProcess;
pub use launcher::{AgentLauncher, CliLauncher, reserve_local_port};
pub use types::{AgentProcess, ProcessError, ProcessExit, wait_for_exit, wait_for_exit_timeout};
