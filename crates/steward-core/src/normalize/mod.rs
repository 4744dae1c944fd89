//! Provider frame → canonical event translation.
//!
//! Each provider has one adapter. [`Adapter`] is a closed enum picked once,
//! at spawn, from the run's [`Provider`] tag. Adapters are pure: they keep a
//! little state between frames (what was already streamed, whether the turn
//! finished) but never block or perform I/O.
//!
//! Frames an adapter does not recognize become a debug-level
//! [`CanonicalEvent::Diagnostic`]; they are never dropped silently and never
//! abort the stream.

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod shell_intent;

use serde_json::Value;

use crate::event::{CanonicalEvent, DiagnosticLevel};
use crate::provider::{Provider, ReasoningPolicy};

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;

/// The translator for one run.
#[derive(Debug)]
pub enum Adapter {
    Claude(ClaudeAdapter),
    Codex(CodexAdapter),
    Gemini(GeminiAdapter),
}

impl Adapter {
    pub fn for_provider(provider: Provider) -> Self {
        let reasoning = provider.capabilities().reasoning;
        match provider {
            Provider::Claude => Adapter::Claude(ClaudeAdapter::new(reasoning)),
            Provider::Codex => Adapter::Codex(CodexAdapter::new(reasoning)),
            Provider::Gemini => Adapter::Gemini(GeminiAdapter::new(reasoning)),
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Adapter::Claude(_) => Provider::Claude,
            Adapter::Codex(_) => Provider::Codex,
            Adapter::Gemini(_) => Provider::Gemini,
        }
    }

    /// Translate one decoded frame.
    pub fn translate(&mut self, frame: &Value) -> Vec<CanonicalEvent> {
        match self {
            Adapter::Claude(a) => a.translate(frame),
            Adapter::Codex(a) => a.translate(frame),
            Adapter::Gemini(a) => a.translate(frame),
        }
    }

    /// Flush anything still pending once the provider's stdout has closed.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        match self {
            Adapter::Codex(a) => a.finish(),
            Adapter::Claude(_) | Adapter::Gemini(_) => Vec::new(),
        }
    }

    /// Whether the provider itself reported the end of the turn.
    pub fn turn_completed(&self) -> bool {
        match self {
            Adapter::Claude(a) => a.turn_completed,
            Adapter::Codex(a) => a.turn_completed,
            Adapter::Gemini(a) => a.turn_completed,
        }
    }
}

/// Apply a reasoning policy to reasoning text.
pub(crate) fn reasoning(policy: ReasoningPolicy, text: &str) -> Option<CanonicalEvent> {
    if text.trim().is_empty() {
        return None;
    }
    match policy {
        ReasoningPolicy::Verbatim => Some(CanonicalEvent::text(text)),
        ReasoningPolicy::Neutral => Some(CanonicalEvent::diagnostic(
            DiagnosticLevel::Debug,
            format!("reasoning: {}", text),
        )),
        ReasoningPolicy::Drop => None,
    }
}

/// Diagnostic for a frame type the adapter does not know.
pub(crate) fn unrecognized(provider: Provider, frame: &Value) -> CanonicalEvent {
    let kind = frame
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("<untyped>");
    log::debug!("Unrecognized {} frame type: {}", provider, kind);
    CanonicalEvent::diagnostic(
        DiagnosticLevel::Debug,
        format!("unrecognized {} frame: {}", provider, kind),
    )
}

/// A frame that is valid JSON but not the provider's expected shape.
pub(crate) fn malformed(provider: Provider, frame: &Value, err: serde_json::Error) -> CanonicalEvent {
    let kind = frame.get("type").and_then(Value::as_str).unwrap_or("<untyped>");
    log::warn!("Malformed {} frame ({}): {}", provider, kind, err);
    CanonicalEvent::diagnostic(
        DiagnosticLevel::Warn,
        format!("malformed {} frame {}: {}", provider, kind, err),
    )
}

/// Flatten tool output that may be a string, a list of text blocks, or other JSON.
pub(crate) fn flatten_output(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => other.get("text").and_then(Value::as_str).map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_matches_provider() {
        for provider in Provider::ALL {
            assert_eq!(Adapter::for_provider(provider).provider(), provider);
        }
    }

    #[test]
    fn reasoning_policies() {
        assert_eq!(
            reasoning(ReasoningPolicy::Verbatim, "hmm"),
            Some(CanonicalEvent::text("hmm"))
        );
        assert!(matches!(
            reasoning(ReasoningPolicy::Neutral, "hmm"),
            Some(CanonicalEvent::Diagnostic {
                level: DiagnosticLevel::Debug,
                ..
            })
        ));
        assert_eq!(reasoning(ReasoningPolicy::Drop, "hmm"), None);
        assert_eq!(reasoning(ReasoningPolicy::Verbatim, "  "), None);
    }

    #[test]
    fn unknown_frames_surface_as_diagnostics() {
        for provider in Provider::ALL {
            let mut adapter = Adapter::for_provider(provider);
            let events = adapter.translate(&json!({"type": "brand_new_thing"}));
            assert_eq!(events.len(), 1, "{}", provider);
            assert!(matches!(
                &events[0],
                CanonicalEvent::Diagnostic { message, .. } if message.contains("brand_new_thing")
            ));
        }
    }

    #[test]
    fn non_object_frames_do_not_panic() {
        for provider in Provider::ALL {
            let mut adapter = Adapter::for_provider(provider);
            let events = adapter.translate(&json!([1, 2, 3]));
            assert_eq!(events.len(), 1);
        }
    }

    #[test]
    fn flatten_output_shapes() {
        assert_eq!(flatten_output(&json!("plain")), "plain");
        assert_eq!(
            flatten_output(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(flatten_output(&json!(null)), "");
        assert_eq!(flatten_output(&json!({"k": 1})), r#"{"k":1}"#);
    }
}
