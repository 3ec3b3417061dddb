//! Lease pool implementation.
//!
//! All bookkeeping lives in one `std::sync::Mutex`; every capacity check and
//! the reservation it guards happen inside a single critical section. Spawns,
//! health polls and terminations run outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agentyard_core::config::PoolConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{CandidateState, LeaseOutcome, LeaseSource, PoolError, PoolStats};
use crate::process::{
    AgentLauncher, AgentProcess, ProcessExit, reserve_local_port, wait_for_exit,
};

struct Candidate {
    process: Arc<dyn AgentProcess>,
    state: CandidateState,
}

#[derive(Default)]
struct PoolState {
    candidates: Vec<Candidate>,
    leased: HashMap<String, Arc<dyn AgentProcess>>,
    /// Spawns in flight, warm and cold.
    spawning: usize,
    /// Subset of `spawning` that will join the warm set.
    warm_spawning: usize,
    refill_failures: u32,
    closed: bool,
}

impl PoolState {
    fn alive(&self) -> usize {
        self.candidates.len() + self.leased.len() + self.spawning
    }

    fn warm(&self) -> usize {
        self.candidates.len() + self.warm_spawning
    }

    fn remove_candidate(&mut self, id: &str) -> Option<Candidate> {
        let idx = self.candidates.iter().position(|c| c.process.id() == id)?;
        Some(self.candidates.remove(idx))
    }
}

struct PoolInner {
    config: PoolConfig,
    launcher: Arc<dyn AgentLauncher>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill_exhausted(&self, failures: u32) -> bool {
        self.config.max_refill_failures > 0 && failures >= self.config.max_refill_failures
    }
}

/// Pool of agent-server processes.
#[derive(Clone)]
pub struct LeasePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for LeasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasePool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl LeasePool {
    /// Create the pool and start warming `min_idle` candidates.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PoolConfig, launcher: Arc<dyn AgentLauncher>) -> Self {
        info!(
            min_idle = config.min_idle,
            max_total = config.max_total,
            startup_timeout_ms = config.startup_timeout_ms,
            "Starting agent pool"
        );
        let inner = Arc::new(PoolInner {
            config,
            launcher,
            state: Mutex::new(PoolState::default()),
        });
        refill(&inner);
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a process.
    ///
    /// Returns `Ok(None)` when nothing could be leased and
    /// `cold_start_fallback` is on; the caller should invoke the agent
    /// directly.
    pub async fn acquire(&self) -> Result<Option<Lease>, PoolError> {
        enum Plan {
            Warm(Arc<dyn AgentProcess>),
            Cold,
        }

        let plan = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.refill_failures = 0;

            let ready = state
                .candidates
                .iter()
                .position(|c| c.state == CandidateState::Ready && !c.process.has_exited());
            if let Some(idx) = ready {
                let candidate = state.candidates.remove(idx);
                state
                    .leased
                    .insert(candidate.process.id().to_string(), Arc::clone(&candidate.process));
                Ok(Plan::Warm(candidate.process))
            } else if state.alive() < self.inner.config.max_total {
                state.spawning += 1;
                Ok(Plan::Cold)
            } else {
                Err(PoolError::Exhausted {
                    alive: state.alive(),
                    max: self.inner.config.max_total,
                })
            }
        };
        refill(&self.inner);

        let result = match plan {
            Ok(Plan::Warm(process)) => {
                info!(lease_id = %process.id(), port = ?process.port(), "Leased warm agent process");
                return Ok(Some(Lease::new(process, LeaseSource::Warm, &self.inner)));
            }
            Ok(Plan::Cold) => cold_spawn(&self.inner).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(lease) => Ok(Some(lease)),
            Err(e) if self.inner.config.cold_start_fallback && !matches!(e, PoolError::Closed) => {
                warn!(error = %e, "No pooled agent available, falling back to direct invocation");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let ready = state
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Ready)
            .count();
        PoolStats {
            warming: state.candidates.len() - ready,
            ready,
            leased: state.leased.len(),
            spawning: state.spawning,
            alive: state.alive(),
        }
    }

    /// Terminate idle candidates and stop refilling.
    ///
    /// Outstanding leases stay valid; they are retired when released.
    pub async fn shutdown(&self) {
        let candidates = {
            let mut state = self.inner.lock();
            state.closed = true;
            std::mem::take(&mut state.candidates)
        };
        info!(idle = candidates.len(), "Shutting down agent pool");
        for candidate in candidates {
            candidate.process.terminate().await;
        }
    }
}

/// Exclusive claim on one pooled process.
///
/// Finish with [`Lease::release`] or [`Lease::retire`]. A lease dropped
/// without either is retired in the background.
pub struct Lease {
    process: Arc<dyn AgentProcess>,
    source: LeaseSource,
    pool: Arc<PoolInner>,
    finished: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.process.id())
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Lease {
    fn new(process: Arc<dyn AgentProcess>, source: LeaseSource, pool: &Arc<PoolInner>) -> Self {
        Self {
            process,
            source,
            pool: Arc::clone(pool),
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        self.process.id()
    }

    pub const fn source(&self) -> LeaseSource {
        self.source
    }

    pub const fn process(&self) -> &Arc<dyn AgentProcess> {
        &self.process
    }

    /// Terminate the process and drop it from the pool.
    pub async fn retire(mut self) {
        self.finished = true;
        retire_process(Arc::clone(&self.pool), Arc::clone(&self.process)).await;
    }

    /// Return a cleanly finished process to the warm set.
    ///
    /// The process is health-checked first; when the check fails, reuse is
    /// disabled, or the pool is shut down, it is retired instead.
    pub async fn release(mut self) -> LeaseOutcome {
        self.finished = true;
        let pool = Arc::clone(&self.pool);
        let process = Arc::clone(&self.process);

        let reusable = pool.config.reuse_released
            && !process.has_exited()
            && pool.launcher.check_health(process.as_ref()).await;

        if reusable {
            let mut state = pool.lock();
            if !state.closed && state.leased.remove(process.id()).is_some() {
                state.candidates.push(Candidate {
                    process: Arc::clone(&process),
                    state: CandidateState::Ready,
                });
                drop(state);
                info!(lease_id = %process.id(), "Returned agent process to warm pool");
                return LeaseOutcome::Returned;
            }
        }

        retire_process(pool, process).await;
        LeaseOutcome::Retired
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let process = Arc::clone(&self.process);
        warn!(lease_id = %process.id(), "Lease dropped without release, retiring");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(retire_process(pool, process));
        } else {
            // No runtime left to await termination; the process is killed
            // when its last handle goes away.
            let mut state = pool.lock();
            state.leased.remove(process.id());
        }
    }
}

async fn retire_process(pool: Arc<PoolInner>, process: Arc<dyn AgentProcess>) {
    process.terminate().await;
    {
        let mut state = pool.lock();
        state.leased.remove(process.id());
        state.remove_candidate(process.id());
    }
    info!(lease_id = %process.id(), "Retired agent process");
    refill(&pool);
}

/// Top the warm set up to `min_idle` within `max_total`.
fn refill(inner: &Arc<PoolInner>) {
    let count = {
        let mut state = inner.lock();
        if state.closed || inner.refill_exhausted(state.refill_failures) {
            return;
        }
        let needed = inner.config.min_idle.saturating_sub(state.warm());
        let room = inner.config.max_total.saturating_sub(state.alive());
        let count = needed.min(room);
        state.spawning += count;
        state.warm_spawning += count;
        count
    };
    if count > 0 {
        debug!(count, "Refilling agent pool");
    }
    for _ in 0..count {
        tokio::spawn(warm_candidate(Arc::clone(inner)));
    }
}

/// Refill after `refill_backoff_ms`.
fn schedule_refill(inner: &Arc<PoolInner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(inner.config.refill_backoff()).await;
        refill(&inner);
    });
}

async fn warm_candidate(inner: Arc<PoolInner>) {
    let spawned = match reserve_local_port() {
        Ok(port) => inner.launcher.spawn_server(port).await,
        Err(e) => Err(e),
    };

    let admitted = {
        let mut state = inner.lock();
        state.spawning -= 1;
        state.warm_spawning -= 1;
        match spawned {
            Ok(process) => {
                if !state.closed {
                    state.candidates.push(Candidate {
                        process: Arc::clone(&process),
                        state: CandidateState::Warming,
                    });
                }
                Ok((process, !state.closed))
            }
            Err(e) => {
                state.refill_failures += 1;
                Err((e, state.refill_failures))
            }
        }
    };
    let process = match admitted {
        Ok((process, true)) => process,
        Ok((process, false)) => {
            process.terminate().await;
            return;
        }
        Err((e, failures)) => {
            warn!(error = %e, failures, "Failed to spawn warm agent process");
            schedule_refill(&inner);
            return;
        }
    };
    tokio::spawn(watch_idle_exit(Arc::clone(&inner), Arc::clone(&process)));

    match wait_ready(&inner, process.as_ref()).await {
        Ok(()) => {
            let mut state = inner.lock();
            if let Some(candidate) = state
                .candidates
                .iter_mut()
                .find(|c| c.process.id() == process.id())
            {
                candidate.state = CandidateState::Ready;
                state.refill_failures = 0;
                drop(state);
                info!(lease_id = %process.id(), port = ?process.port(), "Warm agent process ready");
            }
        }
        Err(e) => {
            warn!(lease_id = %process.id(), error = %e, "Discarding warm agent process");
            process.terminate().await;
            let failures = {
                let mut state = inner.lock();
                state.remove_candidate(process.id());
                state.refill_failures += 1;
                state.refill_failures
            };
            if inner.refill_exhausted(failures) {
                warn!(failures, "Giving up on background refill until next acquire");
            }
            schedule_refill(&inner);
        }
    }
}

async fn cold_spawn(inner: &Arc<PoolInner>) -> Result<Lease, PoolError> {
    let spawned = match reserve_local_port() {
        Ok(port) => inner.launcher.spawn_server(port).await,
        Err(e) => Err(e),
    };

    let admitted = {
        let mut state = inner.lock();
        state.spawning -= 1;
        let process = spawned?;
        if !state.closed {
            state
                .leased
                .insert(process.id().to_string(), Arc::clone(&process));
        }
        (process, !state.closed)
    };
    let process = match admitted {
        (process, true) => process,
        (process, false) => {
            process.terminate().await;
            return Err(PoolError::Closed);
        }
    };
    tokio::spawn(watch_idle_exit(Arc::clone(inner), Arc::clone(&process)));

    match wait_ready(inner, process.as_ref()).await {
        Ok(()) => {
            info!(lease_id = %process.id(), port = ?process.port(), "Leased cold agent process");
            Ok(Lease::new(process, LeaseSource::Cold, inner))
        }
        Err(e) => {
            warn!(lease_id = %process.id(), error = %e, "Cold agent process failed to start");
            retire_process(Arc::clone(inner), process).await;
            Err(e)
        }
    }
}

/// Poll health serially until ready, exited, or `startup_timeout_ms`
/// after spawn.
async fn wait_ready(inner: &PoolInner, process: &dyn AgentProcess) -> Result<(), PoolError> {
    let timeout = inner.config.startup_timeout();
    let timed_out = || PoolError::StartupTimeout {
        timeout_ms: inner.config.startup_timeout_ms,
    };
    let deadline = Instant::now() + timeout;
    let mut exit_rx = process.exit_watch();

    loop {
        if let Some(exit) = exit_rx.borrow_and_update().clone() {
            return Err(PoolError::ExitedDuringStartup { exit });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, inner.launcher.check_health(process)).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(_) => return Err(timed_out()),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        tokio::select! {
            () = tokio::time::sleep(inner.config.health_poll_interval().min(remaining)) => {}
            changed = exit_rx.changed() => {
                if changed.is_err() {
                    return Err(PoolError::ExitedDuringStartup {
                        exit: ProcessExit::Errored {
                            reason: "process monitor went away".to_string(),
                        },
                    });
                }
            }
        }
    }
}

/// Drop a ready idle candidate once its process exits.
async fn watch_idle_exit(inner: Arc<PoolInner>, process: Arc<dyn AgentProcess>) {
    let exit = wait_for_exit(process.as_ref()).await;
    let removed = {
        let mut state = inner.lock();
        let idx = state
            .candidates
            .iter()
            .position(|c| c.process.id() == process.id() && c.state == CandidateState::Ready);
        idx.map(|idx| state.candidates.remove(idx)).is_some()
    };
    if removed {
        warn!(lease_id = %process.id(), %exit, "Idle agent process exited");
        refill(&inner);
    }
}
