//! Tests for the permission broker.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use agentyard_core::ndjson::{PermissionPrompt, PromptKind};
use serde_json::json;

use super::*;

fn request(id: &str, task_id: &str) -> PermissionRequest {
    PermissionRequest {
        id: id.to_string(),
        task_id: task_id.to_string(),
        kind: PermissionKind::ToolApproval,
        tool_name: Some("Bash".to_string()),
        question: None,
        file_path: None,
        options: Vec::new(),
        multi_select: false,
        input: json!({"command": "ls"}),
        timeout: None,
    }
}

fn question(id: &str, options: &[&str], multi_select: bool) -> PermissionRequest {
    PermissionRequest {
        kind: PermissionKind::Question,
        tool_name: None,
        question: Some("Which one?".to_string()),
        options: options.iter().map(ToString::to_string).collect(),
        multi_select,
        ..request(id, "task-1")
    }
}

fn broker() -> PermissionBroker {
    PermissionBroker::new(Duration::from_secs(300))
}

#[tokio::test]
async fn resolve_delivers_decision_once() {
    let broker = broker();
    let pending = broker.register(request("req-1", "task-1")).unwrap();
    assert_eq!(pending.request_id(), "req-1");
    assert_eq!(broker.pending_count(), 1);

    assert!(broker.resolve("req-1", PermissionResponse::allow("req-1")));
    assert!(!broker.resolve("req-1", PermissionResponse::deny("req-1")));

    let resolution = pending.wait().await;
    assert!(resolution.is_allowed());
    assert_eq!(resolution.source, ResolutionSource::User);
    assert_eq!(resolution.task_id, "task-1");
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn unknown_request_is_a_noop() {
    let broker = broker();
    assert!(!broker.resolve("missing", PermissionResponse::allow("missing")));
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let broker = broker();
    let _pending = broker.register(request("req-1", "task-1")).unwrap();
    let err = broker.register(request("req-1", "task-2")).unwrap_err();
    assert!(matches!(err, PermissionError::AlreadyPending { request_id } if request_id == "req-1"));
}

#[tokio::test]
async fn empty_request_id_is_rejected() {
    let err = broker().register(request("", "task-1")).unwrap_err();
    assert!(matches!(err, PermissionError::InvalidRequest(_)));
}

#[tokio::test(start_paused = true)]
async fn timeout_resolves_to_deny_exactly_once() {
    let broker = broker();
    let mut resolutions = broker.subscribe();
    let pending = broker
        .register(PermissionRequest {
            timeout: Some(Duration::from_secs(5)),
            ..request("req-1", "task-1")
        })
        .unwrap();

    let resolution = pending.wait().await;
    assert!(!resolution.is_allowed());
    assert_eq!(resolution.source, ResolutionSource::Timeout);
    assert!(resolution.selected_options.is_empty());

    // A late answer is ignored.
    assert!(!broker.resolve("req-1", PermissionResponse::allow("req-1")));

    let broadcast = resolutions.recv().await.unwrap();
    assert_eq!(broadcast.source, ResolutionSource::Timeout);
    assert!(resolutions.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn default_timeout_applies_when_request_has_none() {
    let broker = PermissionBroker::new(Duration::from_secs(2));
    let pending = broker.register(request("req-1", "task-1")).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.pending_count(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(broker.pending_count(), 0);
    assert_eq!(pending.wait().await.source, ResolutionSource::Timeout);
}

#[tokio::test(start_paused = true)]
async fn user_answer_cancels_timer() {
    let broker = broker();
    let mut resolutions = broker.subscribe();
    let pending = broker
        .register(PermissionRequest {
            timeout: Some(Duration::from_secs(1)),
            ..request("req-1", "task-1")
        })
        .unwrap();
    assert!(broker.resolve("req-1", PermissionResponse::deny("req-1")));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pending.wait().await.source, ResolutionSource::User);
    assert_eq!(resolutions.recv().await.unwrap().source, ResolutionSource::User);
    assert!(resolutions.try_recv().is_err());
}

#[tokio::test]
async fn single_select_keeps_first_offered_option() {
    let broker = broker();
    let pending = broker
        .register(question("q-1", &["red", "green", "blue"], false))
        .unwrap();

    let response = PermissionResponse::allow("q-1").with_options(["purple", "green", "blue"]);
    assert!(broker.resolve("q-1", response));
    assert_eq!(pending.wait().await.selected_options, vec!["green"]);
}

#[tokio::test]
async fn multi_select_drops_unknown_options() {
    let broker = broker();
    let pending = broker
        .register(question("q-1", &["red", "green", "blue"], true))
        .unwrap();

    let response = PermissionResponse::allow("q-1")
        .with_options(["blue", "purple", "red"])
        .with_text("both");
    assert!(broker.resolve("q-1", response));
    let resolution = pending.wait().await;
    assert_eq!(resolution.selected_options, vec!["blue", "red"]);
    assert_eq!(resolution.custom_text.as_deref(), Some("both"));
}

#[tokio::test]
async fn cancel_for_task_only_touches_that_task() {
    let broker = broker();
    let a1 = broker.register(request("a-1", "task-a")).unwrap();
    let a2 = broker.register(request("a-2", "task-a")).unwrap();
    let _b1 = broker.register(request("b-1", "task-b")).unwrap();

    assert_eq!(broker.pending_for_task("task-a").len(), 2);
    assert_eq!(broker.cancel_for_task("task-a"), 2);
    assert_eq!(broker.cancel_for_task("task-a"), 0);

    for pending in [a1, a2] {
        let resolution = pending.wait().await;
        assert_eq!(resolution.source, ResolutionSource::Cancelled);
        assert!(!resolution.is_allowed());
    }
    let remaining = broker.pending_for_task("task-b");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "b-1");
}

#[test]
fn prompt_converts_with_task_timeout_override() {
    let prompt = PermissionPrompt {
        request_id: "req-9".to_string(),
        kind: PromptKind::File,
        tool_name: None,
        question: None,
        file_path: Some("/tmp/x".to_string()),
        options: Vec::new(),
        multi_select: false,
        timeout_ms: Some(1500),
        input: serde_json::Value::Null,
    };

    let from_prompt = PermissionRequest::from_prompt("task-1", prompt.clone(), None);
    assert_eq!(from_prompt.kind, PermissionKind::FileOperation);
    assert_eq!(from_prompt.timeout, Some(Duration::from_millis(1500)));

    let overridden =
        PermissionRequest::from_prompt("task-1", prompt, Some(Duration::from_secs(10)));
    assert_eq!(overridden.timeout, Some(Duration::from_secs(10)));
}

#[test]
fn resolution_converts_to_agent_reply() {
    let resolution = PermissionResolution {
        request_id: "req-1".to_string(),
        task_id: "task-1".to_string(),
        decision: Decision::Allow,
        selected_options: vec!["yes".to_string()],
        custom_text: None,
        source: ResolutionSource::User,
    };
    let reply = resolution.to_reply();
    assert_eq!(reply.decision, "allow");
    assert_eq!(reply.selected_options, vec!["yes"]);
}
