//! Provider variants, their capability table, and invocation building.
//!
//! Every supported CLI is one variant of [`Provider`]. Anything that differs
//! between providers at spawn time (resume style, how non-interactive mode is
//! requested, what happens to reasoning output) is declared once in
//! [`ProviderCapabilities`] and looked up by tag, never discovered at runtime.
//!
//! # Argument Order
//!
//! Arguments are always built in the same order:
//!
//! 1. resume token (when continuing a session)
//! 2. prompt
//! 3. model, output format and verbosity flags
//! 4. the print-and-exit flag
//!
//! Codex is the one exception: its non-interactive mode is the `exec`
//! subcommand, which has to come before everything else.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// A supported LLM command-line provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

/// Error returned when parsing an unknown provider name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}' (expected one of: claude, codex, gemini)")]
pub struct UnknownProvider(pub String);

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Claude, Provider::Codex, Provider::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    /// Executable name looked up on PATH and in conventional directories.
    pub fn binary_name(&self) -> &'static str {
        self.as_str()
    }

    /// Environment variable holding an explicit binary override.
    pub fn override_env_var(&self) -> String {
        format!("STEWARD_{}_BIN", self.as_str().to_ascii_uppercase())
    }

    pub fn capabilities(&self) -> &'static ProviderCapabilities {
        match self {
            Provider::Claude => &CLAUDE,
            Provider::Codex => &CODEX,
            Provider::Gemini => &GEMINI,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => Ok(Provider::Claude),
            "codex" | "openai" => Ok(Provider::Codex),
            "gemini" => Ok(Provider::Gemini),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

// ============================================================================
// Capability table
// ============================================================================

/// How a provider continues an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStyle {
    /// `<flag> <id>`, e.g. `--resume abc`.
    Flag(&'static str),
    /// `<word> <id>` directly after the print-mode subcommand.
    Subcommand(&'static str),
}

/// How a provider is told to run one turn and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    /// A trailing flag, e.g. `--print`.
    Flag(&'static str),
    /// A leading subcommand, e.g. `exec`.
    Subcommand(&'static str),
    /// The prompt flag itself implies non-interactive mode; the listed
    /// arguments are still appended last.
    PromptFlag(&'static [&'static str]),
}

/// What happens to reasoning ("thinking") content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPolicy {
    /// Forwarded as ordinary text.
    Verbatim,
    /// Forwarded as a debug-level diagnostic.
    Neutral,
    /// Discarded.
    Drop,
}

/// Static per-provider facts used by the invocation builder and adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub resume: ResumeStyle,
    pub print_mode: PrintMode,
    /// Flag that precedes the prompt, or `None` for a positional prompt.
    pub prompt_flag: Option<&'static str>,
    pub model_flag: &'static str,
    /// Output-format and verbosity flags.
    pub stream_flags: &'static [&'static str],
    pub reasoning: ReasoningPolicy,
    /// Usage reports are running totals for the session rather than per turn.
    pub cumulative_usage: bool,
}

static CLAUDE: ProviderCapabilities = ProviderCapabilities {
    resume: ResumeStyle::Flag("--resume"),
    print_mode: PrintMode::Flag("--print"),
    prompt_flag: Some("-p"),
    model_flag: "--model",
    stream_flags: &["--output-format", "stream-json", "--verbose"],
    reasoning: ReasoningPolicy::Neutral,
    cumulative_usage: false,
};

static CODEX: ProviderCapabilities = ProviderCapabilities {
    resume: ResumeStyle::Subcommand("resume"),
    print_mode: PrintMode::Subcommand("exec"),
    prompt_flag: None,
    model_flag: "-m",
    stream_flags: &["--json", "--skip-git-repo-check"],
    reasoning: ReasoningPolicy::Drop,
    cumulative_usage: true,
};

static GEMINI: ProviderCapabilities = ProviderCapabilities {
    resume: ResumeStyle::Flag("--resume"),
    print_mode: PrintMode::PromptFlag(&["--approval-mode", "yolo"]),
    prompt_flag: Some("-p"),
    model_flag: "-m",
    stream_flags: &["--output-format", "stream-json"],
    reasoning: ReasoningPolicy::Verbatim,
    cumulative_usage: false,
};

// ============================================================================
// Invocation
// ============================================================================

/// Everything needed to build one provider command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub provider: Provider,
    pub prompt: String,
    pub resume: Option<SessionId>,
    pub model: Option<String>,
    /// Appended after the stream flags, before the print-mode flag.
    pub extra_args: Vec<String>,
}

impl Invocation {
    pub fn new(provider: Provider, prompt: impl Into<String>) -> Self {
        Self {
            provider,
            prompt: prompt.into(),
            resume: None,
            model: None,
            extra_args: Vec::new(),
        }
    }

    pub fn resume(mut self, session_id: SessionId) -> Self {
        self.resume = Some(session_id);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Build the argument vector (binary path not included).
    pub fn build_args(&self) -> Vec<String> {
        let caps = self.provider.capabilities();
        let mut args = Vec::with_capacity(10 + self.extra_args.len());

        if let PrintMode::Subcommand(sub) = caps.print_mode {
            args.push(sub.to_string());
        }

        if let Some(session_id) = &self.resume {
            args.extend(resume_args(self.provider, session_id));
        }

        if let Some(flag) = caps.prompt_flag {
            args.push(flag.to_string());
        }
        args.push(self.prompt.clone());

        if let Some(model) = self.model.as_deref().filter(|m| !m.is_empty()) {
            args.push(caps.model_flag.to_string());
            args.push(model.to_string());
        }
        args.extend(caps.stream_flags.iter().map(|s| s.to_string()));
        args.extend(self.extra_args.iter().cloned());

        match caps.print_mode {
            PrintMode::Flag(flag) => args.push(flag.to_string()),
            PrintMode::PromptFlag(trailing) => {
                args.extend(trailing.iter().map(|s| s.to_string()))
            }
            PrintMode::Subcommand(_) => {}
        }

        args
    }
}

/// The provider-specific resume arguments for a captured session id.
pub fn resume_args(provider: Provider, session_id: &SessionId) -> Vec<String> {
    match provider.capabilities().resume {
        ResumeStyle::Flag(flag) | ResumeStyle::Subcommand(flag) => {
            vec![flag.to_string(), session_id.as_str().to_string()]
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
