//! Spawning agent processes from the configured binary.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agentyard_core::config::PoolConfig;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::child::ChildProcess;
use super::types::{AgentProcess, ProcessError};
use crate::probe::HttpProbe;

/// Placeholder substituted with the server port in `server_args`.
const PORT_PLACEHOLDER: &str = "{port}";

/// Floor for a single health request, independent of the poll interval.
const MIN_HEALTH_TIMEOUT: Duration = Duration::from_millis(500);

/// Spawns agent processes and answers whether they are ready.
#[async_trait]
pub trait AgentLauncher: Send + Sync + 'static {
    /// Start a long-running agent server listening on `port`.
    async fn spawn_server(&self, port: u16) -> Result<Arc<dyn AgentProcess>, ProcessError>;

    /// Start a one-shot agent that serves a single task over stdio.
    async fn spawn_direct(
        &self,
        working_directory: Option<PathBuf>,
    ) -> Result<Arc<dyn AgentProcess>, ProcessError>;

    /// Whether the process answers its health endpoint with our signature.
    async fn check_health(&self, process: &dyn AgentProcess) -> bool;
}

/// Launcher for the configured agent CLI.
#[derive(Debug, Clone)]
pub struct CliLauncher {
    config: PoolConfig,
    probe: HttpProbe,
}

impl CliLauncher {
    pub fn new(config: PoolConfig) -> Result<Self, ProcessError> {
        let timeout = config.health_poll_interval().max(MIN_HEALTH_TIMEOUT);
        let probe = HttpProbe::new(timeout)?;
        Ok(Self { config, probe })
    }

    fn resolve_working_dir(&self, requested: Option<&Path>) -> PathBuf {
        let requested = requested.or(self.config.working_directory.as_deref());
        match requested {
            Some(dir) if !dir.as_os_str().is_empty() && dir.exists() => dir.to_path_buf(),
            other => {
                let fallback = dirs::home_dir().unwrap_or_else(|| {
                    warn!("dirs::home_dir() returned None; falling back to temp_dir for working directory");
                    std::env::temp_dir()
                });
                if let Some(dir) = other {
                    warn!(
                        requested = %dir.display(),
                        fallback = %fallback.display(),
                        "Working directory missing or empty, using fallback"
                    );
                }
                fallback
            }
        }
    }

    fn command(&self, working_dir: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.agent_bin);
        cmd.current_dir(working_dir).args(args);

        // Keep HOME and PATH even under a stripped service environment.
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", &home);
        }
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", &path);
        }
        cmd
    }

    fn server_args(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.config
            .server_args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

#[async_trait]
impl AgentLauncher for CliLauncher {
    async fn spawn_server(&self, port: u16) -> Result<Arc<dyn AgentProcess>, ProcessError> {
        let working_dir = self.resolve_working_dir(None);
        let mut cmd = self.command(&working_dir, &self.server_args(port));
        cmd.env("AGENTYARD_PORT", port.to_string());

        let process = ChildProcess::spawn(cmd, Some(port))?;
        info!(
            process_id = %process.id(),
            pid = ?process.pid(),
            port,
            bin = %self.config.agent_bin.display(),
            "Spawned agent server"
        );
        Ok(Arc::new(process))
    }

    async fn spawn_direct(
        &self,
        working_directory: Option<PathBuf>,
    ) -> Result<Arc<dyn AgentProcess>, ProcessError> {
        let working_dir = self.resolve_working_dir(working_directory.as_deref());
        let cmd = self.command(&working_dir, &self.config.direct_args);

        let process = ChildProcess::spawn(cmd, None)?;
        info!(
            process_id = %process.id(),
            pid = ?process.pid(),
            working_dir = %working_dir.display(),
            "Spawned direct agent invocation"
        );
        Ok(Arc::new(process))
    }

    async fn check_health(&self, process: &dyn AgentProcess) -> bool {
        if process.has_exited() {
            return false;
        }
        let Some(port) = process.port() else {
            return false;
        };
        let healthy = self
            .probe
            .check_marker(port, &self.config.health_path, &self.config.health_marker)
            .await
            .is_ours();
        debug!(process_id = %process.id(), port, healthy, "Health check");
        healthy
    }
}

/// Reserve a free localhost port by binding `127.0.0.1:0`.
///
/// The listener is closed before returning, so the port is only likely free.
pub fn reserve_local_port() -> Result<u16, ProcessError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| ProcessError::PortUnavailable(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| ProcessError::PortUnavailable(e.to_string()))?
        .port();
    Ok(port)
}
