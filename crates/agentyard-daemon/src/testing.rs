//! In-memory agent processes and launcher for unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::ports::PortProbe;
use crate::probe::ProbeOutcome;
use crate::process::{AgentLauncher, AgentProcess, ProcessError, ProcessExit};

/// Maps each line written to a fake process to the lines it answers with.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

pub struct FakeProcess {
    id: String,
    port: Option<u16>,
    ready_at: Instant,
    healthy: AtomicBool,
    interrupted: AtomicBool,
    responder: Option<Responder>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    out_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    sent: Mutex<Vec<String>>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
}

impl std::fmt::Debug for FakeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProcess")
            .field("id", &self.id)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl FakeProcess {
    pub fn new(port: Option<u16>, startup_delay: Duration, responder: Option<Responder>) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, _) = watch::channel(None);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            port,
            ready_at: Instant::now() + startup_delay,
            healthy: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            responder,
            out_tx: Mutex::new(Some(out_tx)),
            out_rx: tokio::sync::Mutex::new(out_rx),
            sent: Mutex::new(Vec::new()),
            exit_tx,
        }
    }

    /// Whether the fake health endpoint would answer right now.
    pub fn is_ready(&self) -> bool {
        !self.has_exited() && self.healthy.load(Ordering::SeqCst) && Instant::now() >= self.ready_at
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Push a line onto the fake's stdout.
    pub fn emit(&self, line: impl Into<String>) {
        if let Some(tx) = self.out_tx.lock().unwrap().as_ref() {
            let _ = tx.send(line.into());
        }
    }

    /// End the process with `exit`; stdout closes once drained.
    pub fn exit(&self, exit: ProcessExit) {
        self.out_tx.lock().unwrap().take();
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_values(&self) -> Vec<Value> {
        self.sent_lines()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentProcess for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    async fn send_line(&self, line: String) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Err(ProcessError::StdinClosed {
                id: self.id.clone(),
            });
        }
        let replies = match (&self.responder, serde_json::from_str::<Value>(&line)) {
            (Some(responder), Ok(value)) => responder(&value),
            _ => Vec::new(),
        };
        self.sent.lock().unwrap().push(line);
        for reply in replies {
            self.emit(reply);
        }
        Ok(())
    }

    async fn next_line(&self) -> Option<String> {
        self.out_rx.lock().await.recv().await
    }

    fn interrupt(&self) -> Result<(), ProcessError> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.exit(ProcessExit::Exited { code: Some(130) });
        Ok(())
    }

    async fn terminate(&self) {
        self.exit(ProcessExit::Killed);
    }

    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_tx.subscribe()
    }
}

/// Launcher producing [`FakeProcess`]es.
#[derive(Default)]
pub struct FakeLauncher {
    pub startup_delay: Duration,
    pub responder: Option<Responder>,
    pub fail_spawn: AtomicBool,
    /// Health checks fail while set.
    pub unhealthy: AtomicBool,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    direct: Mutex<Vec<Arc<FakeProcess>>>,
    max_alive: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(startup_delay: Duration) -> Self {
        Self {
            startup_delay,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn server_spawns(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn direct_spawns(&self) -> usize {
        self.direct.lock().unwrap().len()
    }

    pub fn servers(&self) -> Vec<Arc<FakeProcess>> {
        self.processes.lock().unwrap().clone()
    }

    pub fn direct_processes(&self) -> Vec<Arc<FakeProcess>> {
        self.direct.lock().unwrap().clone()
    }

    pub fn find(&self, id: &str) -> Option<Arc<FakeProcess>> {
        self.servers()
            .into_iter()
            .chain(self.direct_processes())
            .find(|p| p.id() == id)
    }

    /// Server processes currently alive.
    pub fn alive(&self) -> usize {
        self.servers().iter().filter(|p| !p.has_exited()).count()
    }

    /// Highest number of simultaneously alive server processes observed.
    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentLauncher for FakeLauncher {
    async fn spawn_server(&self, port: u16) -> Result<Arc<dyn AgentProcess>, ProcessError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProcessError::SpawnFailed {
                reason: "fake spawn failure".to_string(),
            });
        }
        let process = Arc::new(FakeProcess::new(
            Some(port),
            self.startup_delay,
            self.responder.clone(),
        ));
        self.processes.lock().unwrap().push(Arc::clone(&process));
        self.max_alive.fetch_max(self.alive(), Ordering::SeqCst);
        Ok(process)
    }

    async fn spawn_direct(
        &self,
        _working_directory: Option<PathBuf>,
    ) -> Result<Arc<dyn AgentProcess>, ProcessError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProcessError::SpawnFailed {
                reason: "fake spawn failure".to_string(),
            });
        }
        let process = Arc::new(FakeProcess::new(
            None,
            Duration::ZERO,
            self.responder.clone(),
        ));
        self.direct.lock().unwrap().push(Arc::clone(&process));
        Ok(process)
    }

    async fn check_health(&self, process: &dyn AgentProcess) -> bool {
        if self.unhealthy.load(Ordering::SeqCst) {
            return false;
        }
        self.find(process.id()).is_some_and(|p| p.is_ready())
    }
}

/// Port probe answering every HTTP port the same way; CDP always answers.
pub struct StaticProbe(pub ProbeOutcome);

#[async_trait]
impl PortProbe for StaticProbe {
    async fn probe_http(&self, _port: u16) -> ProbeOutcome {
        self.0.clone()
    }

    async fn probe_cdp(&self, _port: u16) -> bool {
        true
    }
}

/// Port probe that holds every HTTP probe until [`GatedProbe::open`].
pub struct GatedProbe {
    open: watch::Sender<bool>,
    probes: AtomicUsize,
}

impl Default for GatedProbe {
    fn default() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open,
            probes: AtomicUsize::new(0),
        }
    }
}

impl GatedProbe {
    /// Let held and future probes answer "nothing listening".
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// HTTP probes started so far.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for GatedProbe {
    async fn probe_http(&self, _port: u16) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        ProbeOutcome::NoResponse
    }

    async fn probe_cdp(&self, _port: u16) -> bool {
        true
    }
}
