//! `agentyard` Daemon Library
//!
//! Runs coding-agent tasks on local agent processes:
//! - Task lifecycle manager with a bounded FIFO queue
//! - Warm/cold lease pool of agent-server processes
//! - Browser-automation port allocation
//! - Permission broker for tool approvals and questions

pub mod lease;
pub mod permission;
pub mod ports;
pub mod probe;
pub mod process;
pub mod task;

#[cfg(test)]
mod testing;
