//! Codex `exec --json` adapter.
//!
//! # Frame Types
//!
//! - `thread.started`: carries `thread_id`, Codex's session id
//! - `turn.started` / `turn.completed` / `turn.failed`
//! - `item.started` / `item.updated` / `item.completed`: an `item` whose
//!   `type` is one of `agent_message`, `reasoning`, `command_execution`,
//!   `file_change`, `mcp_tool_call`, `web_search`, `todo_list`, `error`
//! - `error`: a stream-level error
//!
//! Codex reports tool use as shell commands. The command text is mapped to
//! a tool name by [`infer_tool`].

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::event::{CanonicalEvent, DiagnosticLevel, FailureKind};
use crate::provider::{Provider, ReasoningPolicy};

use super::shell_intent::infer_tool;
use super::{malformed, reasoning, unrecognized};

#[derive(Debug, Deserialize)]
struct CodexFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    item: Option<Item>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", alias = "item_type")]
    item_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    aggregated_output: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    changes: Option<Vec<FileChange>>,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileChange {
    path: String,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    cached_input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Text(String),
    Object {
        #[serde(default)]
        message: Option<String>,
    },
}

impl ErrorBody {
    fn text(&self) -> Option<&str> {
        match self {
            ErrorBody::Text(s) => Some(s),
            ErrorBody::Object { message } => message.as_deref(),
        }
    }
}

/// State carried between Codex frames.
#[derive(Debug)]
pub struct CodexAdapter {
    reasoning: ReasoningPolicy,
    thread_id: Option<String>,
    /// Items whose invocation was already emitted on `item.started`.
    started: HashSet<String>,
    /// Totals already reported, for providers that report running totals.
    reported: [u64; 3],
    pub(super) turn_completed: bool,
}

impl CodexAdapter {
    pub fn new(reasoning: ReasoningPolicy) -> Self {
        Self {
            reasoning,
            thread_id: None,
            started: HashSet::new(),
            reported: [0; 3],
            turn_completed: false,
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn translate(&mut self, frame: &Value) -> Vec<CanonicalEvent> {
        if frame.get("type").and_then(Value::as_str).is_none() {
            return vec![unrecognized(Provider::Codex, frame)];
        }
        let parsed = match CodexFrame::deserialize(frame) {
            Ok(parsed) => parsed,
            Err(e) => return vec![malformed(Provider::Codex, frame, e)],
        };

        match parsed.frame_type.as_str() {
            "thread.started" => match parsed.thread_id {
                Some(id) if self.thread_id.as_deref() != Some(id.as_str()) => {
                    self.thread_id = Some(id.clone());
                    vec![CanonicalEvent::SessionBegin {
                        session_id: id,
                        provider: Provider::Codex,
                        model: None,
                    }]
                }
                _ => Vec::new(),
            },
            "turn.started" => Vec::new(),
            "item.started" => parsed.item.map(|i| self.item_started(i)).unwrap_or_default(),
            "item.updated" => Vec::new(),
            "item.completed" => parsed.item.map(|i| self.item_completed(i)).unwrap_or_default(),
            "turn.completed" => {
                let usage = parsed.usage.unwrap_or_default();
                self.turn_completed = true;
                vec![self.usage_report(usage), CanonicalEvent::TurnComplete {}]
            }
            "turn.failed" => {
                let detail = parsed
                    .error
                    .as_ref()
                    .and_then(ErrorBody::text)
                    .unwrap_or("turn failed")
                    .to_string();
                vec![CanonicalEvent::failure(FailureKind::Provider, detail)]
            }
            "error" => {
                let detail = parsed
                    .message
                    .or_else(|| parsed.error.as_ref().and_then(ErrorBody::text).map(str::to_string))
                    .unwrap_or_else(|| "Codex reported an error".to_string());
                vec![CanonicalEvent::failure(FailureKind::Provider, detail)]
            }
            _ => vec![unrecognized(Provider::Codex, frame)],
        }
    }

    /// Commands that started but never completed, reported as failed results.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut pending: Vec<String> = self.started.drain().collect();
        pending.sort();
        pending
            .into_iter()
            .map(|id| CanonicalEvent::ToolResult {
                ok: false,
                output: format!("{} did not complete before the stream ended", id),
            })
            .collect()
    }

    fn usage_report(&mut self, usage: Usage) -> CanonicalEvent {
        let totals = [
            usage.input_tokens.unwrap_or(0),
            usage.output_tokens.unwrap_or(0),
            usage.cached_input_tokens.unwrap_or(0),
        ];
        let [input, output, cache] = if Provider::Codex.capabilities().cumulative_usage {
            let delta = [
                totals[0].saturating_sub(self.reported[0]),
                totals[1].saturating_sub(self.reported[1]),
                totals[2].saturating_sub(self.reported[2]),
            ];
            self.reported = totals;
            delta
        } else {
            totals
        };
        CanonicalEvent::UsageReport {
            input_tokens: input,
            output_tokens: output,
            cache_tokens: cache,
        }
    }

    fn item_started(&mut self, item: Item) -> Vec<CanonicalEvent> {
        match item.item_type.as_str() {
            "command_execution" | "mcp_tool_call" | "web_search" => {
                if let Some(id) = &item.id {
                    self.started.insert(id.clone());
                }
                invocation(&item).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    fn item_completed(&mut self, item: Item) -> Vec<CanonicalEvent> {
        let already_started = item
            .id
            .as_ref()
            .map(|id| self.started.remove(id))
            .unwrap_or(false);

        match item.item_type.as_str() {
            "agent_message" => item
                .text
                .filter(|t| !t.is_empty())
                .map(CanonicalEvent::text)
                .into_iter()
                .collect(),
            "reasoning" => reasoning(self.reasoning, item.text.as_deref().unwrap_or_default())
                .into_iter()
                .collect(),
            "command_execution" | "mcp_tool_call" | "web_search" => {
                let mut events = Vec::new();
                if !already_started {
                    events.extend(invocation(&item));
                }
                let ok = match item.item_type.as_str() {
                    "command_execution" => item.exit_code.map(|c| c == 0).unwrap_or(false),
                    _ => item.status.as_deref() != Some("failed"),
                };
                events.push(CanonicalEvent::ToolResult {
                    ok,
                    output: item.aggregated_output.clone().unwrap_or_default(),
                });
                events
            }
            "file_change" => {
                let changes = item.changes.unwrap_or_default();
                let mut events: Vec<CanonicalEvent> = changes
                    .iter()
                    .map(|change| CanonicalEvent::ToolInvocation {
                        name: "Edit".to_string(),
                        arguments: json!({
                            "file_path": change.path,
                            "kind": change.kind.as_deref().unwrap_or("update"),
                        }),
                    })
                    .collect();
                events.push(CanonicalEvent::ToolResult {
                    ok: item.status.as_deref() != Some("failed"),
                    output: changes
                        .iter()
                        .map(|c| c.path.as_str())
                        .collect::<Vec<_>>()
                        .join("\n"),
                });
                events
            }
            "error" => vec![CanonicalEvent::diagnostic(
                DiagnosticLevel::Warn,
                item.message.unwrap_or_else(|| "Codex item error".to_string()),
            )],
            "todo_list" => Vec::new(),
            other => {
                log::debug!("Unrecognized Codex item type: {}", other);
                vec![CanonicalEvent::diagnostic(
                    DiagnosticLevel::Debug,
                    format!("unrecognized codex item: {}", other),
                )]
            }
        }
    }
}

fn invocation(item: &Item) -> Option<CanonicalEvent> {
    match item.item_type.as_str() {
        "command_execution" => {
            let command = item.command.as_deref()?;
            let tool = infer_tool(command);
            Some(CanonicalEvent::ToolInvocation {
                name: tool.name.to_string(),
                arguments: tool.arguments,
            })
        }
        "mcp_tool_call" => Some(CanonicalEvent::ToolInvocation {
            name: match (&item.server, &item.tool) {
                (Some(server), Some(tool)) => format!("mcp__{}__{}", server, tool),
                (None, Some(tool)) => tool.clone(),
                _ => "mcp".to_string(),
            },
            arguments: item.arguments.clone().unwrap_or(Value::Null),
        }),
        "web_search" => Some(CanonicalEvent::ToolInvocation {
            name: "WebSearch".to_string(),
            arguments: json!({ "query": item.query.as_deref().unwrap_or_default() }),
        }),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
