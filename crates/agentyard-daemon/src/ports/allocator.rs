//! Port range scanning and claim tracking.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use agentyard_core::config::PortConfig;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::types::{PortError, PortPair, PortStatus};
use crate::probe::{HttpProbe, ProbeOutcome};

/// Probes used to classify a port pair.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Probe the HTTP port of a pair for our browser-server signature.
    async fn probe_http(&self, port: u16) -> ProbeOutcome;

    /// Whether the CDP port answers.
    async fn probe_cdp(&self, port: u16) -> bool;
}

/// [`PortProbe`] over localhost HTTP.
#[derive(Debug, Clone)]
pub struct HttpPortProbe {
    probe: HttpProbe,
    marker_field: String,
    cdp_probe_path: String,
}

impl HttpPortProbe {
    pub fn new(config: &PortConfig) -> Result<Self, PortError> {
        let probe =
            HttpProbe::new(config.probe_timeout()).map_err(|e| PortError::Client(e.to_string()))?;
        Ok(Self {
            probe,
            marker_field: config.marker_field.clone(),
            cdp_probe_path: config.cdp_probe_path.clone(),
        })
    }
}

#[async_trait]
impl PortProbe for HttpPortProbe {
    async fn probe_http(&self, port: u16) -> ProbeOutcome {
        self.probe.check_marker(port, "/", &self.marker_field).await
    }

    async fn probe_cdp(&self, port: u16) -> bool {
        self.probe.responds(port, &self.cdp_probe_path).await
    }
}

type ClaimSet = Arc<Mutex<HashSet<u16>>>;

fn lock_claims(claims: &Mutex<HashSet<u16>>) -> std::sync::MutexGuard<'_, HashSet<u16>> {
    claims.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process hold on a free pair; released on drop.
#[derive(Debug)]
pub struct PortClaim {
    http_port: u16,
    claims: ClaimSet,
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        lock_claims(&self.claims).remove(&self.http_port);
        debug!(port = self.http_port, "Released port claim");
    }
}

/// Pair handed to a task.
#[derive(Debug)]
pub struct PortAllocation {
    pub pair: PortPair,
    pub status: PortStatus,
    /// Present for free pairs; reused healthy pairs are shared and unclaimed.
    claim: Option<PortClaim>,
}

impl PortAllocation {
    /// Whether a healthy browser server already serves this pair.
    pub const fn reuses_existing(&self) -> bool {
        matches!(self.status, PortStatus::OursHealthy)
    }

    pub const fn is_claimed(&self) -> bool {
        self.claim.is_some()
    }
}

/// Scans the configured range for a usable pair.
#[derive(Clone)]
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    probe: Arc<dyn PortProbe>,
    claims: ClaimSet,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range_start", &self.range_start)
            .field("range_end", &self.range_end)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    pub fn new(config: &PortConfig) -> Result<Self, PortError> {
        let probe = HttpPortProbe::new(config)?;
        Self::with_probe(config.range_start, config.range_end, Arc::new(probe))
    }

    pub fn with_probe(
        range_start: u16,
        range_end: u16,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self, PortError> {
        if range_start == 0 || range_start >= range_end {
            return Err(PortError::InvalidRange {
                start: range_start,
                end: range_end,
            });
        }
        Ok(Self {
            range_start,
            range_end,
            probe,
            claims: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Candidate pairs in scan order; both ports of every pair lie in range.
    pub fn candidates(&self) -> Vec<PortPair> {
        (self.range_start..self.range_end)
            .step_by(2)
            .filter_map(PortPair::from_http)
            .filter(|pair| pair.cdp_port <= self.range_end)
            .collect()
    }

    /// Classify a single pair by probing it.
    pub async fn classify_pair(&self, pair: PortPair) -> PortStatus {
        match self.probe.probe_http(pair.http_port).await {
            ProbeOutcome::NoResponse => PortStatus::Free,
            ProbeOutcome::Foreign => PortStatus::External,
            ProbeOutcome::Ours(_) => {
                if self.probe.probe_cdp(pair.cdp_port).await {
                    PortStatus::OursHealthy
                } else {
                    PortStatus::OursStale
                }
            }
        }
    }

    /// Number of pairs currently claimed in this process.
    pub fn claimed_count(&self) -> usize {
        lock_claims(&self.claims).len()
    }

    /// First free pair (claimed) or first healthy pair of ours (reused).
    pub async fn find_available_ports(&self) -> Result<PortAllocation, PortError> {
        let mut tried = Vec::new();

        for pair in self.candidates() {
            tried.push(pair);
            if lock_claims(&self.claims).contains(&pair.http_port) {
                debug!(%pair, "Port pair claimed by another task");
                continue;
            }

            let status = self.classify_pair(pair).await;
            debug!(%pair, ?status, "Classified port pair");
            match status {
                PortStatus::Free => {
                    // Re-check under the lock: another task may have claimed
                    // the pair while we were probing.
                    let mut claims = lock_claims(&self.claims);
                    if !claims.insert(pair.http_port) {
                        continue;
                    }
                    drop(claims);
                    info!(%pair, "Claimed free port pair");
                    return Ok(PortAllocation {
                        pair,
                        status,
                        claim: Some(PortClaim {
                            http_port: pair.http_port,
                            claims: Arc::clone(&self.claims),
                        }),
                    });
                }
                PortStatus::OursHealthy => {
                    info!(%pair, "Reusing healthy browser server");
                    return Ok(PortAllocation {
                        pair,
                        status,
                        claim: None,
                    });
                }
                PortStatus::OursStale | PortStatus::External => {}
            }
        }

        warn!(
            range_start = self.range_start,
            range_end = self.range_end,
            tried = tried.len(),
            "Port range exhausted"
        );
        Err(PortError::Exhausted {
            range_start: self.range_start,
            range_end: self.range_end,
            tried,
        })
    }
}
