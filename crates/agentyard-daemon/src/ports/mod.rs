//! Browser-automation port pair allocation.
//!
//! Pairs are scanned in stride 2 across the configured range and classified
//! by probing. Free pairs are claimed in-process until the allocation is
//! dropped, so concurrent tasks never share a pair.

mod allocator;
mod types;

#[cfg(test)]
mod tests;

pub use allocator::{HttpPortProbe, PortAllocation, PortAllocator, PortClaim, PortProbe};
pub use types::{PortError, PortPair, PortStatus};
