//! Task lifecycle management.
//!
//! A submitted task is queued or admitted against `max_concurrent_tasks`.
//! An admitted task leases an agent process (and a browser port pair when
//! it needs one), streams the agent's output as [`TaskEvent`]s and parks on
//! the permission broker whenever the agent asks for a decision.

mod events;
mod manager;
mod runner;
mod types;


pub use events::TaskEvents;
pub use manager::TaskManager;
pub use types::{
    FailureContext, Task, TaskError, TaskEvent, TaskMessage, TaskResult, TaskSpec, TaskStatus,
};
