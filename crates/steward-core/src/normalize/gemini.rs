//! Gemini CLI `--output-format stream-json` adapter.
//!
//! Gemini writes plain NDJSON events with a `type` discriminator and
//! snake_case fields:
//!
//! - `init`: session id and model
//! - `message`: user echo or assistant text (`delta: true` while streaming);
//!   `thought: true` marks reasoning
//! - `tool_use` / `tool_result`: correlated by `tool_id`
//! - `error`: `severity` is `warning` or `error`
//! - `result`: final status plus `stats` token counts

use serde::Deserialize;
use serde_json::Value;

use crate::event::{CanonicalEvent, DiagnosticLevel, FailureKind};
use crate::provider::{Provider, ReasoningPolicy};

use super::{flatten_output, malformed, reasoning, unrecognized};

#[derive(Debug, Deserialize)]
struct GeminiFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    stats: Option<Stats>,
}

#[derive(Debug, Default, Deserialize)]
struct Stats {
    #[serde(default, alias = "prompt_tokens")]
    input_tokens: Option<u64>,
    #[serde(default, alias = "candidates_tokens")]
    output_tokens: Option<u64>,
    #[serde(default, alias = "cached_tokens")]
    cached: Option<u64>,
}

/// State carried between Gemini frames.
#[derive(Debug)]
pub struct GeminiAdapter {
    reasoning: ReasoningPolicy,
    session_id: Option<String>,
    pub(super) turn_completed: bool,
}

impl GeminiAdapter {
    pub fn new(reasoning: ReasoningPolicy) -> Self {
        Self {
            reasoning,
            session_id: None,
            turn_completed: false,
        }
    }

    pub fn translate(&mut self, frame: &Value) -> Vec<CanonicalEvent> {
        if frame.get("type").and_then(Value::as_str).is_none() {
            return vec![unrecognized(Provider::Gemini, frame)];
        }
        let parsed = match GeminiFrame::deserialize(frame) {
            Ok(parsed) => parsed,
            Err(e) => return vec![malformed(Provider::Gemini, frame, e)],
        };

        match parsed.frame_type.as_str() {
            "init" => match parsed.session_id {
                Some(id) if self.session_id.as_deref() != Some(id.as_str()) => {
                    self.session_id = Some(id.clone());
                    vec![CanonicalEvent::SessionBegin {
                        session_id: id,
                        provider: Provider::Gemini,
                        model: parsed.model,
                    }]
                }
                _ => Vec::new(),
            },
            "message" => {
                if parsed.role.as_deref() == Some("user") {
                    return Vec::new();
                }
                let text = parsed.content.as_ref().map(flatten_output).unwrap_or_default();
                if parsed.thought.unwrap_or(false) {
                    reasoning(self.reasoning, &text).into_iter().collect()
                } else if text.is_empty() {
                    Vec::new()
                } else {
                    vec![CanonicalEvent::text(text)]
                }
            }
            "tool_use" => vec![CanonicalEvent::ToolInvocation {
                name: parsed.tool_name.unwrap_or_else(|| "unknown".to_string()),
                arguments: parsed.parameters.unwrap_or(Value::Null),
            }],
            "tool_result" => {
                let ok = parsed.status.as_deref() != Some("error");
                let output = if ok {
                    parsed.output.as_ref().map(flatten_output).unwrap_or_default()
                } else {
                    parsed
                        .error
                        .as_ref()
                        .map(error_text)
                        .or_else(|| parsed.output.as_ref().map(flatten_output))
                        .unwrap_or_default()
                };
                vec![CanonicalEvent::ToolResult { ok, output }]
            }
            "error" => {
                let message = parsed
                    .message
                    .or_else(|| parsed.error.as_ref().map(error_text))
                    .unwrap_or_else(|| "Gemini reported an error".to_string());
                match parsed.severity.as_deref() {
                    Some("warning") => vec![CanonicalEvent::diagnostic(DiagnosticLevel::Warn, message)],
                    _ => vec![CanonicalEvent::failure(FailureKind::Provider, message)],
                }
            }
            "result" => {
                let stats = parsed.stats.unwrap_or_default();
                let mut events = vec![CanonicalEvent::UsageReport {
                    input_tokens: stats.input_tokens.unwrap_or(0),
                    output_tokens: stats.output_tokens.unwrap_or(0),
                    cache_tokens: stats.cached.unwrap_or(0),
                }];
                if parsed.status.as_deref() == Some("error") {
                    let detail = parsed
                        .error
                        .as_ref()
                        .map(error_text)
                        .unwrap_or_else(|| "turn failed".to_string());
                    events.push(CanonicalEvent::failure(FailureKind::Provider, detail));
                }
                self.turn_completed = true;
                events.push(CanonicalEvent::TurnComplete {});
                events
            }
            _ => vec![unrecognized(Provider::Gemini, frame)],
        }
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
