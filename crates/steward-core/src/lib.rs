//! # steward-core
//!
//! Process orchestration and stream normalization for LLM coding CLIs
//! (Claude, Codex, Gemini) run as child processes.
//!
//! The crate has no UI and no transport of its own; a host asks for a turn
//! and reads canonical events back from a bounded channel.
//!
//! ## Key Concepts
//!
//! - **Run**: one provider process answering one prompt, identified by a
//!   [`RunId`] and owned by the [`Registry`] from spawn to reap
//! - **Session**: the provider's conversation id, captured from early output
//!   and used to resume the conversation in a later run
//! - **CanonicalEvent**: the provider-neutral event every adapter emits
//! - **Frame**: one newline-delimited JSON object on a provider's stdout

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod locator;
pub mod logging;
pub mod normalize;
pub mod paths;
mod pipeline;
pub mod process;
pub mod provider;
pub mod reader;
pub mod registry;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use channel::{event_channel, EventSender, EventStream};
pub use config::SupervisorConfig;
pub use error::{Error, Result};
pub use event::{CanonicalEvent, DiagnosticLevel, FailureKind, RunEvent};
pub use locator::{CachedLocator, Locator, LocatorError};
pub use provider::{resume_args, Invocation, Provider};
pub use registry::{ProcessInfo, Registry, RunId, SweepReport, TerminateOutcome};
pub use session::{MemorySessionStore, SessionId, SessionRecord, SessionStore};
pub use supervisor::{RunHandle, RunTarget, Supervisor, SupervisorError, TurnRequest};
