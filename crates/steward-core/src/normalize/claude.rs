//! Claude Code `--output-format stream-json` adapter.
//!
//! # Frame Types
//!
//! - `system` / `init`: session id and model
//! - `assistant`: a complete message with `text`, `thinking` and `tool_use` blocks
//! - `user`: tool results fed back to the model (`tool_result` blocks)
//! - `stream_event`: partial-message deltas (only with partial messages enabled)
//! - `result`: end of the turn, with usage totals
//! - `error`: a fatal error reported by the CLI
//!
//! When partial deltas were streamed for a message, the complete `assistant`
//! frame that follows repeats the same text; those blocks are skipped so text
//! is delivered once.
//!
//! Every frame carries `session_id`. The first one seen becomes the run's
//! `SessionBegin`; a different id later in the stream (Claude forks a new id
//! when resuming) is announced again as a hand-off.

use serde::Deserialize;
use serde_json::Value;

use crate::event::{CanonicalEvent, DiagnosticLevel, FailureKind};
use crate::provider::{Provider, ReasoningPolicy};

use super::{flatten_output, malformed, reasoning, unrecognized};

#[derive(Debug, Deserialize)]
struct ClaudeFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<Message>,
    /// Wrapped Anthropic stream event (`stream_event` frames).
    #[serde(default)]
    event: Option<StreamEvent>,
    /// Bare `content_block_delta` frames carry the delta at top level.
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    model: Option<String>,
    /// A string for plain user prompts, otherwise a list of blocks.
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    is_error: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

/// State carried between Claude frames.
#[derive(Debug)]
pub struct ClaudeAdapter {
    reasoning: ReasoningPolicy,
    session_id: Option<String>,
    streamed_text: bool,
    streamed_thinking: bool,
    pub(super) turn_completed: bool,
}

impl ClaudeAdapter {
    pub fn new(reasoning: ReasoningPolicy) -> Self {
        Self {
            reasoning,
            session_id: None,
            streamed_text: false,
            streamed_thinking: false,
            turn_completed: false,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn translate(&mut self, frame: &Value) -> Vec<CanonicalEvent> {
        if frame.get("type").and_then(Value::as_str).is_none() {
            return vec![unrecognized(Provider::Claude, frame)];
        }
        let parsed = match ClaudeFrame::deserialize(frame) {
            Ok(parsed) => parsed,
            Err(e) => return vec![malformed(Provider::Claude, frame, e)],
        };

        let mut events = Vec::new();
        self.announce_session(&parsed, &mut events);

        match parsed.frame_type.as_str() {
            "system" => match parsed.subtype.as_deref() {
                Some("init") => {}
                other => log::debug!("Ignoring Claude system frame {:?}", other),
            },
            "assistant" => self.assistant(&parsed, &mut events),
            "user" => self.tool_results(&parsed, &mut events),
            "stream_event" => {
                if let Some(event) = &parsed.event {
                    self.stream_event(&event.event_type, event.delta.as_ref(), &mut events);
                }
            }
            "message_start" | "content_block_start" | "content_block_delta"
            | "content_block_stop" | "message_delta" | "message_stop" => {
                self.stream_event(&parsed.frame_type, parsed.delta.as_ref(), &mut events)
            }
            "result" => self.result(&parsed, &mut events),
            "error" => {
                let detail = parsed
                    .error
                    .as_ref()
                    .map(error_text)
                    .unwrap_or_else(|| "Claude reported an error".to_string());
                events.push(CanonicalEvent::failure(FailureKind::Provider, detail));
            }
            "control_request" | "keep_alive" | "rate_limit_event" => {
                log::debug!("Ignoring Claude {} frame", parsed.frame_type);
            }
            _ => events.push(unrecognized(Provider::Claude, frame)),
        }
        events
    }

    fn announce_session(&mut self, frame: &ClaudeFrame, events: &mut Vec<CanonicalEvent>) {
        let Some(id) = frame.session_id.as_deref().filter(|id| !id.is_empty()) else {
            return;
        };
        if self.session_id.as_deref() == Some(id) {
            return;
        }
        self.session_id = Some(id.to_string());
        let model = frame
            .model
            .clone()
            .or_else(|| frame.message.as_ref().and_then(|m| m.model.clone()));
        events.push(CanonicalEvent::SessionBegin {
            session_id: id.to_string(),
            provider: Provider::Claude,
            model,
        });
    }

    fn assistant(&mut self, frame: &ClaudeFrame, events: &mut Vec<CanonicalEvent>) {
        let skip_text = std::mem::take(&mut self.streamed_text);
        let skip_thinking = std::mem::take(&mut self.streamed_thinking);

        for block in blocks(frame) {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = block.text.filter(|t| !t.is_empty() && !skip_text) {
                        events.push(CanonicalEvent::text(text));
                    }
                }
                "thinking" => {
                    if !skip_thinking {
                        let text = block.thinking.unwrap_or_default();
                        events.extend(reasoning(self.reasoning, &text));
                    }
                }
                "redacted_thinking" => {}
                "tool_use" => events.push(CanonicalEvent::ToolInvocation {
                    name: block.name.unwrap_or_else(|| "unknown".to_string()),
                    arguments: block.input.unwrap_or(Value::Null),
                }),
                other => log::debug!("Ignoring Claude content block {}", other),
            }
        }
    }

    fn tool_results(&mut self, frame: &ClaudeFrame, events: &mut Vec<CanonicalEvent>) {
        for block in blocks(frame) {
            if block.block_type == "tool_result" {
                events.push(CanonicalEvent::ToolResult {
                    ok: !block.is_error.unwrap_or(false),
                    output: block.content.as_ref().map(flatten_output).unwrap_or_default(),
                });
            }
        }
    }

    fn stream_event(&mut self, event_type: &str, delta: Option<&Delta>, events: &mut Vec<CanonicalEvent>) {
        if event_type != "content_block_delta" {
            return;
        }
        let Some(delta) = delta else {
            return;
        };
        match delta.delta_type.as_deref() {
            Some("text_delta") | None => {
                if let Some(text) = delta.text.as_deref().filter(|t| !t.is_empty()) {
                    self.streamed_text = true;
                    events.push(CanonicalEvent::text(text));
                }
            }
            Some("thinking_delta") => {
                if let Some(text) = delta.thinking.as_deref() {
                    self.streamed_thinking = true;
                    events.extend(reasoning(self.reasoning, text));
                }
            }
            _ => {}
        }
    }

    fn result(&mut self, frame: &ClaudeFrame, events: &mut Vec<CanonicalEvent>) {
        let usage = frame.usage.as_ref();
        events.push(CanonicalEvent::UsageReport {
            input_tokens: usage.and_then(|u| u.input_tokens).unwrap_or(0),
            output_tokens: usage.and_then(|u| u.output_tokens).unwrap_or(0),
            cache_tokens: usage
                .map(|u| {
                    u.cache_creation_input_tokens.unwrap_or(0) + u.cache_read_input_tokens.unwrap_or(0)
                })
                .unwrap_or(0),
        });

        if frame.is_error.unwrap_or(false) {
            let detail = frame
                .result
                .as_ref()
                .map(flatten_output)
                .filter(|s| !s.is_empty())
                .or_else(|| frame.subtype.clone())
                .unwrap_or_else(|| "turn failed".to_string());
            events.push(CanonicalEvent::failure(FailureKind::Provider, detail));
        } else if frame.subtype.as_deref().is_some_and(|s| s != "success") {
            events.push(CanonicalEvent::diagnostic(
                DiagnosticLevel::Warn,
                format!("turn ended with {}", frame.subtype.as_deref().unwrap_or_default()),
            ));
        }

        self.turn_completed = true;
        events.push(CanonicalEvent::TurnComplete {});
    }
}

fn blocks(frame: &ClaudeFrame) -> Vec<ContentBlock> {
    let Some(Value::Array(items)) = frame.message.as_ref().map(|m| &m.content) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match ContentBlock::deserialize(item) {
            Ok(block) => Some(block),
            Err(e) => {
                log::debug!("Skipping Claude content block: {}", e);
                None
            }
        })
        .collect()
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> ClaudeAdapter {
        ClaudeAdapter::new(ReasoningPolicy::Neutral)
    }

    mod session {
        use super::*;

        #[test]
        fn init_announces_session_once() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "system", "subtype": "init",
                "session_id": "sess-1", "model": "claude-opus-4"
            }));
            assert_eq!(
                events,
                vec![CanonicalEvent::SessionBegin {
                    session_id: "sess-1".to_string(),
                    provider: Provider::Claude,
                    model: Some("claude-opus-4".to_string()),
                }]
            );

            let events = a.translate(&json!({
                "type": "assistant", "session_id": "sess-1",
                "message": {"role": "assistant", "content": [{"type": "text", "text": "hi"}]}
            }));
            assert_eq!(events, vec![CanonicalEvent::text("hi")]);
        }

        #[test]
        fn changed_id_is_announced_again() {
            let mut a = adapter();
            a.translate(&json!({"type": "system", "subtype": "init", "session_id": "old"}));
            let events = a.translate(&json!({"type": "system", "subtype": "init", "session_id": "new"}));
            assert_eq!(events[0].session_id(), Some("new"));
            assert_eq!(a.session_id(), Some("new"));
        }
    }

    mod content {
        use super::*;

        #[test]
        fn assistant_blocks_in_order() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "assistant",
                "message": {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "plan"},
                    {"type": "text", "text": "Running ls"},
                    {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
                ]}
            }));
            assert_eq!(events.len(), 3);
            assert!(matches!(&events[0], CanonicalEvent::Diagnostic { message, .. } if message == "reasoning: plan"));
            assert_eq!(events[1], CanonicalEvent::text("Running ls"));
            assert_eq!(
                events[2],
                CanonicalEvent::ToolInvocation {
                    name: "Bash".to_string(),
                    arguments: json!({"command": "ls"}),
                }
            );
        }

        #[test]
        fn tool_results_from_user_frames() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "user",
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "file.txt"},
                    {"type": "tool_result", "tool_use_id": "t2",
                     "content": [{"type": "text", "text": "denied"}], "is_error": true}
                ]}
            }));
            assert_eq!(
                events,
                vec![
                    CanonicalEvent::ToolResult { ok: true, output: "file.txt".to_string() },
                    CanonicalEvent::ToolResult { ok: false, output: "denied".to_string() },
                ]
            );
        }

        #[test]
        fn plain_user_prompt_yields_nothing() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "user", "message": {"role": "user", "content": "hello"}
            }));
            assert!(events.is_empty());
        }

        #[test]
        fn streamed_text_is_not_repeated() {
            let mut a = adapter();
            let mut events = Vec::new();
            for piece in ["Hel", "lo"] {
                events.extend(a.translate(&json!({
                    "type": "stream_event",
                    "event": {"type": "content_block_delta", "index": 0,
                              "delta": {"type": "text_delta", "text": piece}}
                })));
            }
            events.extend(a.translate(&json!({
                "type": "assistant",
                "message": {"role": "assistant", "content": [{"type": "text", "text": "Hello"}]}
            })));
            assert_eq!(events, vec![CanonicalEvent::text("Hel"), CanonicalEvent::text("lo")]);

            // The next complete message was not streamed and is delivered.
            let events = a.translate(&json!({
                "type": "assistant",
                "message": {"role": "assistant", "content": [{"type": "text", "text": "Again"}]}
            }));
            assert_eq!(events, vec![CanonicalEvent::text("Again")]);
        }

        #[test]
        fn top_level_delta_frames() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "content_block_delta", "delta": {"type": "text_delta", "text": "x"}
            }));
            assert_eq!(events, vec![CanonicalEvent::text("x")]);
        }

        #[test]
        fn verbatim_policy_streams_thinking_as_text() {
            let mut a = ClaudeAdapter::new(ReasoningPolicy::Verbatim);
            let events = a.translate(&json!({
                "type": "assistant",
                "message": {"role": "assistant", "content": [{"type": "thinking", "thinking": "hmm"}]}
            }));
            assert_eq!(events, vec![CanonicalEvent::text("hmm")]);
        }
    }

    mod completion {
        use super::*;

        #[test]
        fn result_reports_usage_then_completes() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "result", "subtype": "success", "is_error": false, "result": "done",
                "usage": {"input_tokens": 10, "output_tokens": 20,
                          "cache_creation_input_tokens": 3, "cache_read_input_tokens": 4}
            }));
            assert_eq!(
                events,
                vec![
                    CanonicalEvent::UsageReport { input_tokens: 10, output_tokens: 20, cache_tokens: 7 },
                    CanonicalEvent::TurnComplete {},
                ]
            );
            assert!(a.turn_completed);
        }

        #[test]
        fn error_result_fails_before_completing() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "result", "subtype": "error_during_execution", "is_error": true,
                "result": "API Error: overloaded"
            }));
            assert_eq!(events.len(), 3);
            assert_eq!(
                events[1],
                CanonicalEvent::failure(FailureKind::Provider, "API Error: overloaded")
            );
            assert_eq!(events[2], CanonicalEvent::TurnComplete {});
        }

        #[test]
        fn error_frame_is_failure() {
            let mut a = adapter();
            let events = a.translate(&json!({"type": "error", "error": {"message": "bad key"}}));
            assert_eq!(events, vec![CanonicalEvent::failure(FailureKind::Provider, "bad key")]);
        }

        #[test]
        fn null_usage_fields_default_to_zero() {
            let mut a = adapter();
            let events = a.translate(&json!({
                "type": "result", "subtype": "success",
                "usage": {"input_tokens": null, "output_tokens": 5}
            }));
            assert_eq!(
                events[0],
                CanonicalEvent::UsageReport { input_tokens: 0, output_tokens: 5, cache_tokens: 0 }
            );
        }
    }

    mod robustness {
        use super::*;

        #[test]
        fn wrong_field_shape_is_diagnosed() {
            let mut a = adapter();
            let events = a.translate(&json!({"type": "assistant", "message": "oops"}));
            assert!(matches!(
                &events[0],
                CanonicalEvent::Diagnostic { level: DiagnosticLevel::Warn, .. }
            ));
        }

        #[test]
        fn ignored_frames_emit_nothing() {
            let mut a = adapter();
            assert!(a.translate(&json!({"type": "system", "subtype": "hook_response"})).is_empty());
            assert!(a.translate(&json!({"type": "stream_event", "event": {"type": "message_stop"}})).is_empty());
        }
    }
}
