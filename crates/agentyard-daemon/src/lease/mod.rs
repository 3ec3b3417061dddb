//! Warm pool of agent-server processes.
//!
//! The pool keeps `min_idle` candidates spawned ahead of demand and never has
//! more than `max_total` processes alive (warming, ready, leased, or being
//! spawned). Acquire hands out a ready candidate when there is one and
//! otherwise cold-spawns, or tells the caller to invoke the agent directly.

mod pool;
mod types;


pub use pool::{Lease, LeasePool};
pub use types::{CandidateState, LeaseOutcome, LeaseSource, PoolError, PoolStats};
