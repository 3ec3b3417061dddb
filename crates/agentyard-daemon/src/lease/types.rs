//! Lease pool types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::process::{ProcessError, ProcessExit};

/// Where a lease's process came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseSource {
    /// Taken from the ready warm set.
    Warm,
    /// Spawned on demand for this acquire.
    Cold,
}

impl fmt::Display for LeaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
        }
    }
}

/// State of an idle pool candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Spawned, health check not yet passed.
    Warming,
    /// Passed its health check; may be handed out.
    Ready,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub warming: usize,
    pub ready: usize,
    pub leased: usize,
    /// Spawns in flight (warm and cold).
    pub spawning: usize,
    /// Everything counted against `max_total`.
    pub alive: usize,
}

/// What happened to a released lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Back in the warm set.
    Returned,
    /// Terminated.
    Retired,
}

/// Errors from the lease pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Agent pool exhausted ({alive}/{max} processes alive)")]
    Exhausted { alive: usize, max: usize },

    #[error(transparent)]
    Spawn(#[from] ProcessError),

    #[error("Agent process not ready after {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },

    #[error("Agent process {exit} during startup")]
    ExitedDuringStartup { exit: ProcessExit },

    #[error("Agent pool is shut down")]
    Closed,
}
