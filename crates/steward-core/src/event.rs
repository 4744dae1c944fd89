//! The canonical event type shared by every provider adapter.
//!
//! Adapters translate provider-native frames into [`CanonicalEvent`]s; the
//! supervisor wraps each one in a [`RunEvent`] that records which run (and
//! which session, once known) produced it.
//!
//! # Wire Format
//!
//! Events are written as newline-delimited JSON:
//!
//! ```json
//! {"type":"text_delta","text":"hello","session_id":"0b9e4c1f-..."}
//! {"type":"turn_complete","session_id":"0b9e4c1f-..."}
//! ```
//!
//! `session_id` is omitted until the session is known.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::Provider;
use crate::registry::RunId;

/// Severity of a [`CanonicalEvent::Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Category of a [`CanonicalEvent::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A frame exceeded the reader's ceiling and was discarded.
    OversizedFrame,
    /// The output pipe failed.
    Stream,
    /// The process exited with a non-zero status.
    ExitStatus,
    /// The run was terminated by the supervisor.
    Terminated,
    /// The provider reported an error of its own.
    Provider,
}

/// One unit of conversation progress, identical across providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    SessionBegin {
        session_id: String,
        provider: Provider,
        model: Option<String>,
    },
    TextDelta {
        text: String,
    },
    ToolInvocation {
        name: String,
        arguments: Value,
    },
    ToolResult {
        ok: bool,
        output: String,
    },
    UsageReport {
        input_tokens: u64,
        output_tokens: u64,
        cache_tokens: u64,
    },
    Diagnostic {
        level: DiagnosticLevel,
        message: String,
    },
    TurnComplete {},
    Failure {
        kind: FailureKind,
        detail: String,
    },
}

impl CanonicalEvent {
    pub fn text(text: impl Into<String>) -> Self {
        CanonicalEvent::TextDelta { text: text.into() }
    }

    pub fn diagnostic(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        CanonicalEvent::Diagnostic {
            level,
            message: message.into(),
        }
    }

    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        CanonicalEvent::Failure {
            kind,
            detail: detail.into(),
        }
    }

    /// The wire `type` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalEvent::SessionBegin { .. } => "session_begin",
            CanonicalEvent::TextDelta { .. } => "text_delta",
            CanonicalEvent::ToolInvocation { .. } => "tool_invocation",
            CanonicalEvent::ToolResult { .. } => "tool_result",
            CanonicalEvent::UsageReport { .. } => "usage_report",
            CanonicalEvent::Diagnostic { .. } => "diagnostic",
            CanonicalEvent::TurnComplete {} => "turn_complete",
            CanonicalEvent::Failure { .. } => "failure",
        }
    }

    /// Session id carried by a `SessionBegin`.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CanonicalEvent::SessionBegin { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

/// A canonical event tagged with the run that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub run_id: RunId,
    pub session_id: Option<String>,
    pub event: CanonicalEvent,
}

impl RunEvent {
    pub fn new(run_id: RunId, session_id: Option<String>, event: CanonicalEvent) -> Self {
        Self {
            run_id,
            session_id,
            event,
        }
    }

    /// Serialize to one NDJSON line (without the trailing newline).
    ///
    /// The run id stays local; only the session id is part of the wire shape.
    /// A `SessionBegin` already carries its own `session_id` field.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.event)?;
        if let (Some(id), Value::Object(map)) = (&self.session_id, &mut value) {
            map.entry("session_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        serde_json::to_string(&value)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod serialization {
        use super::*;

        #[test]
        fn session_begin_is_snake_case_tagged() {
            let event = CanonicalEvent::SessionBegin {
                session_id: "s-1".to_string(),
                provider: Provider::Claude,
                model: Some("opus".to_string()),
            };
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(
                value,
                json!({"type": "session_begin", "session_id": "s-1", "provider": "claude", "model": "opus"})
            );
        }

        #[test]
        fn turn_complete_has_only_type() {
            let value = serde_json::to_value(CanonicalEvent::TurnComplete {}).unwrap();
            assert_eq!(value, json!({"type": "turn_complete"}));
        }

        #[test]
        fn failure_kind_is_snake_case() {
            let event = CanonicalEvent::failure(FailureKind::OversizedFrame, "too big");
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["kind"], "oversized_frame");
        }

        #[test]
        fn deserializes_back() {
            let event: CanonicalEvent = serde_json::from_str(
                r#"{"type":"usage_report","input_tokens":3,"output_tokens":4,"cache_tokens":5}"#,
            )
            .unwrap();
            assert_eq!(
                event,
                CanonicalEvent::UsageReport {
                    input_tokens: 3,
                    output_tokens: 4,
                    cache_tokens: 5
                }
            );
        }

        #[test]
        fn kind_matches_wire_tag() {
            let events = [
                CanonicalEvent::text("x"),
                CanonicalEvent::TurnComplete {},
                CanonicalEvent::diagnostic(DiagnosticLevel::Warn, "w"),
                CanonicalEvent::ToolResult {
                    ok: true,
                    output: String::new(),
                },
            ];
            for event in events {
                let value = serde_json::to_value(&event).unwrap();
                assert_eq!(value["type"], event.kind());
            }
        }
    }

    mod wire {
        use super::*;

        #[test]
        fn omits_session_id_when_unknown() {
            let line = RunEvent::new(RunId(1), None, CanonicalEvent::text("hi"))
                .to_wire()
                .unwrap();
            assert_eq!(line, r#"{"text":"hi","type":"text_delta"}"#);
        }

        #[test]
        fn appends_session_id_when_known() {
            let line = RunEvent::new(RunId(1), Some("abc".to_string()), CanonicalEvent::text("hi"))
                .to_wire()
                .unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["session_id"], "abc");
            assert_eq!(value["type"], "text_delta");
            assert!(!line.contains('\n'));
        }

        #[test]
        fn session_begin_keeps_its_own_id() {
            let event = CanonicalEvent::SessionBegin {
                session_id: "new".to_string(),
                provider: Provider::Codex,
                model: None,
            };
            let line = RunEvent::new(RunId(2), Some("old".to_string()), event)
                .to_wire()
                .unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["session_id"], "new");
            assert_eq!(value["model"], Value::Null);
        }
    }
}
