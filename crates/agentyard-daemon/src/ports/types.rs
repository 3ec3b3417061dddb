//! Port pair types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Adjacent HTTP and CDP ports for one browser-automation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub http_port: u16,
    pub cdp_port: u16,
}

impl PortPair {
    /// Pair starting at `http_port`, or `None` when the CDP port would overflow.
    pub fn from_http(http_port: u16) -> Option<Self> {
        http_port.checked_add(1).map(|cdp_port| Self {
            http_port,
            cdp_port,
        })
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.http_port, self.cdp_port)
    }
}

/// Occupancy of a port pair, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    /// Nothing listens on the HTTP port.
    Free,
    /// Our browser server, with a live CDP endpoint.
    OursHealthy,
    /// Our browser server, but the CDP endpoint is gone.
    OursStale,
    /// Someone else owns the HTTP port.
    External,
}

impl PortStatus {
    /// Whether a pair in this state may be handed to a task.
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Free | Self::OursHealthy)
    }
}

/// Errors from port allocation.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error(
        "No usable port pair in {range_start}-{range_end} ({} pairs tried)",
        tried.len()
    )]
    Exhausted {
        range_start: u16,
        range_end: u16,
        tried: Vec<PortPair>,
    },

    #[error("Invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("Failed to build probe client: {0}")]
    Client(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_adjacent() {
        assert_eq!(
            PortPair::from_http(9224),
            Some(PortPair {
                http_port: 9224,
                cdp_port: 9225
            })
        );
        assert_eq!(PortPair::from_http(u16::MAX), None);
    }

    #[test]
    fn only_free_and_healthy_are_usable() {
        assert!(PortStatus::Free.is_usable());
        assert!(PortStatus::OursHealthy.is_usable());
        assert!(!PortStatus::OursStale.is_usable());
        assert!(!PortStatus::External.is_usable());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&PortStatus::OursHealthy).ok().as_deref(),
            Some("\"ours_healthy\"")
        );
    }
}
