//! Message types for the agent NDJSON envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::Result;

/// Canonical inbound events emitted by an agent process.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The agent assigned (or resumed) a conversation session.
    Session { session_id: String },
    /// A conversational message produced while working.
    Message(AgentMessage),
    /// Coarse progress marker (e.g. "browsing", "editing").
    Progress {
        stage: String,
        message: Option<String>,
    },
    /// The agent needs a human decision before continuing.
    PermissionRequest(PermissionPrompt),
    /// The task finished successfully.
    Complete { summary: Option<String> },
    /// The task failed inside the agent.
    Error { message: String },
    Unknown { msg_type: String, payload: Value },
}

/// Message content relayed from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

fn default_role() -> String {
    "assistant".to_string()
}

/// Kind of human decision requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Approve or deny a tool invocation.
    #[default]
    Tool,
    /// Free-form or selectable question.
    Question,
    /// Approve or deny a file operation.
    File,
}

/// Permission or question request as emitted by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPrompt {
    pub request_id: String,
    #[serde(default)]
    pub kind: PromptKind,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
    /// Per-request timeout budget; the broker default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub input: Value,
}

/// Browser-automation endpoint handed to the agent with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserEndpoint {
    pub http_port: u16,
    pub cdp_port: u16,
    /// `true` when a healthy browser server already listens on the pair.
    pub reuse_existing: bool,
}

/// Task hand-off written to the agent's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserEndpoint>,
}

/// Decision relayed back to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionReply {
    pub request_id: String,
    /// `"allow"` or `"deny"`.
    pub decision: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<String>,
}

/// Messages written to the agent's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Task(TaskEnvelope),
    PermissionResponse(PermissionReply),
    Interrupt,
}

impl Outbound {
    /// Serialize as a single NDJSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
