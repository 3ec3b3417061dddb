//! Permission and question brokering.
//!
//! Agents emit permission requests mid-task; the broker parks each one
//! until an out-of-band response, its timeout, or task cancellation
//! resolves it. It knows nothing about transports.

mod broker;
mod types;

#[cfg(test)]
mod tests;

pub use broker::{PendingPermission, PermissionBroker};
pub use types::{
    Decision, PermissionError, PermissionKind, PermissionRequest, PermissionResolution,
    PermissionResponse, ResolutionSource,
};
