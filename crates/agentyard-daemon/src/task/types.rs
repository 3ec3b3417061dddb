//! Task model types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::PoolError;
use crate::permission::{PermissionError, PermissionRequest, PermissionResolution};
use crate::ports::{PortError, PortPair};
use crate::process::ProcessError;

/// Task lifecycle state.
///
/// `pending -> queued -> running <-> waiting_permission -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    WaitingPermission,
    Completed,
    Failed,
    /// Hard abort.
    Cancelled,
    /// Soft stop with a grace period.
    Interrupted,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Interrupted
        )
    }

    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingPermission => "waiting_permission",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub prompt: String,
    /// Session to resume.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Allocate a browser-automation port pair.
    #[serde(default)]
    pub needs_browser: bool,
    /// Overrides the broker's default permission timeout.
    #[serde(default, skip_serializing)]
    pub permission_timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_browser(mut self) -> Self {
        self.needs_browser = true;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_permission_timeout(mut self, timeout: Duration) -> Self {
        self.permission_timeout = Some(timeout);
        self
    }
}

/// Message relayed from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Structured detail attached to a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureContext {
    PortsExhausted {
        range_start: u16,
        range_end: u16,
        tried: Vec<PortPair>,
    },
    PoolExhausted {
        alive: usize,
        max: usize,
    },
    StartupTimeout {
        timeout_ms: u64,
    },
    SpawnFailed {
        reason: String,
    },
    ProcessExited {
        code: Option<i32>,
    },
    Agent {
        message: String,
    },
}

/// Final outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureContext>,
    pub duration_ms: u64,
}

/// Snapshot of a task record.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub spec: TaskSpec,
    /// Session id learned from the agent (or given for resumption).
    pub session_id: Option<String>,
    pub messages: Vec<TaskMessage>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: String, spec: TaskSpec) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            session_id: spec.session_id.clone(),
            spec,
            messages: Vec::new(),
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Milliseconds since the task started (zero if it never did).
    pub(crate) fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|started| (now - started).num_milliseconds())
            .and_then(|ms| u64::try_from(ms).ok())
            .unwrap_or(0)
    }
}

/// Events delivered on a task's own channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Status {
        task_id: String,
        status: TaskStatus,
    },
    Message {
        task_id: String,
        message: TaskMessage,
    },
    Progress {
        task_id: String,
        stage: String,
        message: Option<String>,
    },
    Session {
        task_id: String,
        session_id: String,
    },
    PermissionRequested {
        task_id: String,
        request: PermissionRequest,
    },
    PermissionResolved {
        task_id: String,
        resolution: PermissionResolution,
    },
    /// Always the last event of a task.
    Finished {
        task_id: String,
        result: TaskResult,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Status { task_id, .. }
            | Self::Message { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Session { task_id, .. }
            | Self::PermissionRequested { task_id, .. }
            | Self::PermissionResolved { task_id, .. }
            | Self::Finished { task_id, .. } => task_id,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// Task manager errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task already active: {task_id}")]
    AlreadyActive { task_id: String },

    #[error("Task not found: {task_id}")]
    NotFound { task_id: String },

    #[error("Task still active: {task_id}")]
    StillActive { task_id: String },

    #[error("Invalid task: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Core(#[from] agentyard_core::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("Agent process exited unexpectedly (code {code:?})")]
    ProcessExited { code: Option<i32> },

    #[error("Agent reported an error: {0}")]
    Agent(String),

    #[error("Task manager is shutting down")]
    ShuttingDown,
}

impl TaskError {
    /// Structured context recorded in the task result.
    pub fn failure_context(&self) -> Option<FailureContext> {
        match self {
            Self::Ports(PortError::Exhausted {
                range_start,
                range_end,
                tried,
            }) => Some(FailureContext::PortsExhausted {
                range_start: *range_start,
                range_end: *range_end,
                tried: tried.clone(),
            }),
            Self::Pool(PoolError::Exhausted { alive, max }) => Some(FailureContext::PoolExhausted {
                alive: *alive,
                max: *max,
            }),
            Self::Pool(PoolError::StartupTimeout { timeout_ms }) => {
                Some(FailureContext::StartupTimeout {
                    timeout_ms: *timeout_ms,
                })
            }
            Self::Pool(PoolError::ExitedDuringStartup { exit }) => {
                Some(FailureContext::ProcessExited { code: exit.code() })
            }
            Self::Pool(PoolError::Spawn(e)) | Self::Process(e) => Some(FailureContext::SpawnFailed {
                reason: e.to_string(),
            }),
            Self::ProcessExited { code } => Some(FailureContext::ProcessExited { code: *code }),
            Self::Agent(message) => Some(FailureContext::Agent {
                message: message.clone(),
            }),
            _ => None,
        }
    }
}
