//! Permission broker types.

use std::time::Duration;

use agentyard_core::ndjson::{PermissionPrompt, PermissionReply, PromptKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the agent is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    ToolApproval,
    Question,
    FileOperation,
}

impl From<PromptKind> for PermissionKind {
    fn from(kind: PromptKind) -> Self {
        match kind {
            PromptKind::Tool => Self::ToolApproval,
            PromptKind::Question => Self::Question,
            PromptKind::File => Self::FileOperation,
        }
    }
}

/// Outstanding permission or question request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionRequest {
    pub id: String,
    pub task_id: String,
    pub kind: PermissionKind,
    pub tool_name: Option<String>,
    pub question: Option<String>,
    pub file_path: Option<String>,
    pub options: Vec<String>,
    pub multi_select: bool,
    pub input: Value,
    /// Wait budget; the broker default applies when `None`.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl PermissionRequest {
    /// Build a request from an agent prompt.
    ///
    /// `timeout_override` (the task's configured budget) wins over the
    /// prompt's own `timeout_ms`.
    pub fn from_prompt(
        task_id: &str,
        prompt: PermissionPrompt,
        timeout_override: Option<Duration>,
    ) -> Self {
        Self {
            id: prompt.request_id,
            task_id: task_id.to_string(),
            kind: prompt.kind.into(),
            tool_name: prompt.tool_name,
            question: prompt.question,
            file_path: prompt.file_path,
            options: prompt.options,
            multi_select: prompt.multi_select,
            input: prompt.input,
            timeout: timeout_override.or_else(|| prompt.timeout_ms.map(Duration::from_millis)),
        }
    }
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub request_id: String,
    pub decision: Decision,
    #[serde(default)]
    pub selected_options: Vec<String>,
    #[serde(default)]
    pub custom_text: Option<String>,
}

impl PermissionResponse {
    pub fn allow(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            decision: Decision::Allow,
            selected_options: Vec::new(),
            custom_text: None,
        }
    }

    pub fn deny(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            decision: Decision::Deny,
            selected_options: Vec::new(),
            custom_text: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.selected_options = options.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.custom_text = Some(text.into());
        self
    }
}

/// Why a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    User,
    Timeout,
    Cancelled,
}

/// Final outcome of a request, delivered to the waiter and to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionResolution {
    pub request_id: String,
    pub task_id: String,
    pub decision: Decision,
    pub selected_options: Vec<String>,
    pub custom_text: Option<String>,
    pub source: ResolutionSource,
}

impl PermissionResolution {
    pub const fn is_allowed(&self) -> bool {
        matches!(self.decision, Decision::Allow)
    }

    /// Reply line payload for the agent.
    pub fn to_reply(&self) -> PermissionReply {
        PermissionReply {
            request_id: self.request_id.clone(),
            decision: self.decision.as_str().to_string(),
            selected_options: self.selected_options.clone(),
            custom_text: self.custom_text.clone(),
        }
    }
}

/// Permission broker errors.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Permission request already pending: {request_id}")]
    AlreadyPending { request_id: String },

    #[error("Invalid permission request: {0}")]
    InvalidRequest(String),
}
