//! Process handle abstraction shared by the pool and the task runner.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

/// How an agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own.
    Exited { code: Option<i32> },
    /// Waiting on the process failed.
    Errored { reason: String },
    /// The process was killed by us.
    Killed,
}

impl ProcessExit {
    /// Exit code, when the process reported one.
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => *code,
            Self::Errored { .. } | Self::Killed => None,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0) })
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Exited { code: None } => write!(f, "exited by signal"),
            Self::Errored { reason } => write!(f, "errored: {reason}"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Handle to a running agent process.
///
/// Implementations must be cheap to share behind an `Arc`; every method takes
/// `&self`.
#[async_trait]
pub trait AgentProcess: Send + Sync + fmt::Debug {
    /// Unique identifier (also used as the lease id).
    fn id(&self) -> &str;

    /// HTTP port the process serves its health endpoint on, if any.
    fn port(&self) -> Option<u16>;

    /// Write one line to the process's stdin.
    async fn send_line(&self, line: String) -> Result<(), ProcessError>;

    /// Next stdout line, or `None` once stdout is closed.
    ///
    /// Cancel-safe: dropping the future loses no line.
    async fn next_line(&self) -> Option<String>;

    /// Ask the process to stop gracefully.
    fn interrupt(&self) -> Result<(), ProcessError>;

    /// Kill the process and wait until it is gone.
    async fn terminate(&self);

    /// Observe the exit; `None` while the process is alive.
    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>>;

    fn has_exited(&self) -> bool {
        self.exit_watch().borrow().is_some()
    }
}

/// Wait until the process has exited.
pub async fn wait_for_exit(process: &dyn AgentProcess) -> ProcessExit {
    let mut rx = process.exit_watch();
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(exit) = current {
            return exit;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or(ProcessExit::Errored {
                reason: "process monitor went away".to_string(),
            });
        }
    }
}

/// Wait for exit, giving up after `timeout`.
pub async fn wait_for_exit_timeout(
    process: &dyn AgentProcess,
    timeout: Duration,
) -> Option<ProcessExit> {
    tokio::time::timeout(timeout, wait_for_exit(process))
        .await
        .ok()
}

/// Errors from process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn agent process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Agent process {id} no longer accepts input")]
    StdinClosed { id: String },

    #[error("Failed to signal agent process {id}: {reason}")]
    SignalFailed { id: String, reason: String },

    #[error("No local port available: {0}")]
    PortUnavailable(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
