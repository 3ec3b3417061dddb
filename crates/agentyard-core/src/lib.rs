//! `agentyard` Core Library
//!
//! Shared functionality for `agentyard` components:
//! - Configuration resolution and hierarchy
//! - NDJSON envelope spoken with agent processes
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
