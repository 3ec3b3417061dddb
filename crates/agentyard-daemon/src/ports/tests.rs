//! Tests for port pair classification and allocation.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::routing::get;
use serde_json::json;

use super::*;
use crate::probe::ProbeOutcome;
use crate::probe::tests::{closed_port, serve};

#[derive(Default)]
struct FakeProbe {
    http: HashMap<u16, ProbeOutcome>,
    cdp_alive: HashSet<u16>,
    delay: Option<Duration>,
}

impl FakeProbe {
    fn external(mut self, port: u16) -> Self {
        self.http.insert(port, ProbeOutcome::Foreign);
        self
    }

    fn ours(mut self, port: u16, cdp_alive: bool) -> Self {
        self.http
            .insert(port, ProbeOutcome::Ours(json!({"wsEndpoint": "ws://x"})));
        if cdp_alive {
            self.cdp_alive.insert(port + 1);
        }
        self
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn probe_http(&self, port: u16) -> ProbeOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.http
            .get(&port)
            .cloned()
            .unwrap_or(ProbeOutcome::NoResponse)
    }

    async fn probe_cdp(&self, port: u16) -> bool {
        self.cdp_alive.contains(&port)
    }
}

fn allocator(start: u16, end: u16, probe: FakeProbe) -> PortAllocator {
    PortAllocator::with_probe(start, end, Arc::new(probe)).unwrap()
}

fn pair(http_port: u16) -> PortPair {
    PortPair::from_http(http_port).unwrap()
}

#[test]
fn candidates_use_stride_two_within_range() {
    let alloc = allocator(9224, 9231, FakeProbe::default());
    assert_eq!(
        alloc.candidates(),
        vec![pair(9224), pair(9226), pair(9228), pair(9230)]
    );

    // 9230's CDP port would fall outside the range.
    let alloc = allocator(9224, 9230, FakeProbe::default());
    assert_eq!(alloc.candidates(), vec![pair(9224), pair(9226), pair(9228)]);
}

#[test]
fn invalid_range_is_rejected() {
    let err = PortAllocator::with_probe(9300, 9200, Arc::new(FakeProbe::default())).unwrap_err();
    assert!(matches!(
        err,
        PortError::InvalidRange {
            start: 9300,
            end: 9200
        }
    ));
    assert!(PortAllocator::with_probe(0, 10, Arc::new(FakeProbe::default())).is_err());
}

#[tokio::test]
async fn skips_external_pair_and_claims_next_free() {
    let alloc = allocator(9224, 9240, FakeProbe::default().external(9224));
    let allocation = alloc.find_available_ports().await.unwrap();
    assert_eq!(allocation.pair, pair(9226));
    assert_eq!(allocation.status, PortStatus::Free);
    assert!(allocation.is_claimed());
    assert!(!allocation.reuses_existing());
}

#[tokio::test]
async fn healthy_pair_of_ours_is_reused_without_claim() {
    let alloc = allocator(
        9224,
        9240,
        FakeProbe::default().external(9224).ours(9226, true),
    );
    let allocation = alloc.find_available_ports().await.unwrap();
    assert_eq!(allocation.pair, pair(9226));
    assert_eq!(allocation.status, PortStatus::OursHealthy);
    assert!(allocation.reuses_existing());
    assert!(!allocation.is_claimed());
    assert_eq!(alloc.claimed_count(), 0);
}

#[tokio::test]
async fn stale_pair_is_skipped() {
    let alloc = allocator(9224, 9240, FakeProbe::default().ours(9224, false));
    assert_eq!(alloc.classify_pair(pair(9224)).await, PortStatus::OursStale);
    let allocation = alloc.find_available_ports().await.unwrap();
    assert_eq!(allocation.pair, pair(9226));
}

#[tokio::test]
async fn fully_foreign_range_reports_every_tried_pair() {
    let probe = FakeProbe::default()
        .external(9224)
        .ours(9226, false)
        .external(9228)
        .external(9230);
    let alloc = allocator(9224, 9231, probe);

    let err = alloc.find_available_ports().await.unwrap_err();
    match err {
        PortError::Exhausted {
            range_start,
            range_end,
            tried,
        } => {
            assert_eq!((range_start, range_end), (9224, 9231));
            assert_eq!(tried, alloc.candidates());
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_allocations_get_distinct_pairs() {
    let probe = FakeProbe {
        delay: Some(Duration::from_millis(20)),
        ..FakeProbe::default()
    };
    let alloc = allocator(9224, 9240, probe);

    let (a, b) = tokio::join!(alloc.find_available_ports(), alloc.find_available_ports());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.pair, b.pair);
    assert_eq!(alloc.claimed_count(), 2);
}

#[tokio::test]
async fn dropping_allocation_releases_claim() {
    let alloc = allocator(9224, 9227, FakeProbe::default());

    let first = alloc.find_available_ports().await.unwrap();
    let second = alloc.find_available_ports().await.unwrap();
    assert_eq!((first.pair, second.pair), (pair(9224), pair(9226)));
    assert!(alloc.find_available_ports().await.is_err());

    drop(first);
    assert_eq!(alloc.claimed_count(), 1);
    let again = alloc.find_available_ports().await.unwrap();
    assert_eq!(again.pair, pair(9224));
}

#[tokio::test]
async fn http_probe_classifies_real_listeners() {
    let config = agentyard_core::config::PortConfig::default();
    let probe = Arc::new(HttpPortProbe::new(&config).unwrap());
    let alloc = PortAllocator::with_probe(1024, 1030, probe).unwrap();

    let foreign = serve(Router::new().route("/", get(|| async { axum::Json(json!({"ok": true})) })))
        .await;
    assert_eq!(
        alloc.classify_pair(PortPair::from_http(foreign).unwrap()).await,
        PortStatus::External
    );

    // Our signature on the HTTP port, nothing on the CDP port.
    let ours = serve(Router::new().route(
        "/",
        get(|| async { axum::Json(json!({"wsEndpoint": "ws://127.0.0.1/devtools"})) }),
    ))
    .await;
    let stale = PortPair {
        http_port: ours,
        cdp_port: closed_port(),
    };
    assert_eq!(alloc.classify_pair(stale).await, PortStatus::OursStale);

    let cdp = serve(Router::new().route(
        "/json/version",
        get(|| async { axum::Json(json!({"Browser": "Chrome"})) }),
    ))
    .await;
    let healthy = PortPair {
        http_port: ours,
        cdp_port: cdp,
    };
    assert_eq!(alloc.classify_pair(healthy).await, PortStatus::OursHealthy);

    let free = PortPair::from_http(closed_port()).unwrap();
    assert_eq!(alloc.classify_pair(free).await, PortStatus::Free);
}
