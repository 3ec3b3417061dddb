//! NDJSON parser for agent stdout.
//!
//! Tolerant reader: unknown fields ignored, unknown types preserved.

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single NDJSON line from an agent's stdout.
pub fn parse_line(line: &str) -> Result<AgentEvent> {
    let raw: Value = serde_json::from_str(line.trim())?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical agent event.
pub fn parse_value(raw: &Value) -> Result<AgentEvent> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    match msg_type {
        "session" => {
            let session_id = required_str(raw, "session_id")?;
            Ok(AgentEvent::Session { session_id })
        }
        "message" => Ok(AgentEvent::Message(serde_json::from_value(raw.clone())?)),
        "progress" => Ok(AgentEvent::Progress {
            stage: optional_str(raw, "stage").unwrap_or_default(),
            message: optional_str(raw, "message"),
        }),
        "permission_request" => {
            let prompt: PermissionPrompt = serde_json::from_value(raw.clone())
                .map_err(|e| Error::NdjsonParse(format!("Invalid permission_request: {e}")))?;
            if prompt.request_id.is_empty() {
                return Err(Error::NdjsonParse(
                    "permission_request with empty request_id".into(),
                ));
            }
            Ok(AgentEvent::PermissionRequest(prompt))
        }
        "complete" => Ok(AgentEvent::Complete {
            summary: optional_str(raw, "summary"),
        }),
        "error" => Ok(AgentEvent::Error {
            message: optional_str(raw, "message")
                .unwrap_or_else(|| "agent reported an error".to_string()),
        }),
        _ => Ok(AgentEvent::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn optional_str(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(String::from)
}

fn required_str(raw: &Value, key: &str) -> Result<String> {
    optional_str(raw, key).ok_or_else(|| Error::NdjsonParse(format!("Missing '{key}' field")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_permission_request_with_defaults() {
        let event = parse_line(
            r#"{"type":"permission_request","request_id":"p-1","tool_name":"Bash","input":{"command":"ls"}}"#,
        )
        .unwrap();
        let AgentEvent::PermissionRequest(prompt) = event else {
            panic!("expected permission request, got {event:?}");
        };
        assert_eq!(prompt.request_id, "p-1");
        assert_eq!(prompt.kind, PromptKind::Tool);
        assert!(prompt.options.is_empty());
        assert!(!prompt.multi_select);
        assert_eq!(prompt.timeout_ms, None);
    }

    #[test]
    fn parses_question_with_options() {
        let event = parse_line(
            r#"{"type":"permission_request","request_id":"q","kind":"question","question":"Which?","options":["a","b"],"multi_select":true,"timeout_ms":1000}"#,
        )
        .unwrap();
        let AgentEvent::PermissionRequest(prompt) = event else {
            panic!("expected permission request");
        };
        assert_eq!(prompt.kind, PromptKind::Question);
        assert_eq!(prompt.options, vec!["a", "b"]);
        assert!(prompt.multi_select);
        assert_eq!(prompt.timeout_ms, Some(1000));
    }

    #[test]
    fn empty_request_id_is_rejected() {
        assert!(parse_line(r#"{"type":"permission_request","request_id":""}"#).is_err());
    }

    #[test]
    fn message_defaults_role() {
        let event = parse_line(r#"{"type":"message","content":"hello"}"#).unwrap();
        assert_eq!(
            event,
            AgentEvent::Message(AgentMessage {
                role: "assistant".into(),
                content: "hello".into(),
            })
        );
    }

    #[test]
    fn unknown_type_is_preserved() {
        let event = parse_line(r#"{"type":"telemetry","cpu":3}"#).unwrap();
        assert!(matches!(event, AgentEvent::Unknown { ref msg_type, .. } if msg_type == "telemetry"));
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(parse_line(r#"{"content":"x"}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn session_requires_id() {
        assert!(parse_line(r#"{"type":"session"}"#).is_err());
        assert_eq!(
            parse_line(r#"{"type":"session","session_id":"s-9"}"#).unwrap(),
            AgentEvent::Session {
                session_id: "s-9".into()
            }
        );
    }

    #[test]
    fn outbound_lines_are_tagged() {
        let line = Outbound::PermissionResponse(PermissionReply {
            request_id: "p-1".into(),
            decision: "deny".into(),
            selected_options: Vec::new(),
            custom_text: None,
        })
        .to_line()
        .unwrap();
        assert_eq!(
            line,
            r#"{"type":"permission_response","request_id":"p-1","decision":"deny"}"#
        );
        assert_eq!(Outbound::Interrupt.to_line().unwrap(), r#"{"type":"interrupt"}"#);
    }

    #[test]
    fn task_envelope_omits_absent_fields() {
        let line = Outbound::Task(TaskEnvelope {
            task_id: "t".into(),
            prompt: "do it".into(),
            session_id: None,
            model: None,
            working_directory: None,
            browser: Some(BrowserEndpoint {
                http_port: 9224,
                cdp_port: 9225,
                reuse_existing: false,
            }),
        })
        .to_line()
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["browser"]["cdp_port"], 9225);
        assert!(value.get("session_id").is_none());
    }
}
