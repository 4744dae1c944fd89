//! Session identity: capture, fallback, and resume.
//!
//! A provider announces its conversation id in an early frame, which adapters
//! turn into [`CanonicalEvent::SessionBegin`]. [`SessionWatch`] waits for that
//! event for a bounded window after spawn. When the window passes without one,
//! it synthesizes a local id so the conversation can still be tracked, and the
//! run is marked degraded with a warning diagnostic.
//!
//! Continuing a conversation never replays earlier turns through stdin; it
//! spawns a new run with the provider's resume arguments (see
//! [`crate::provider::resume_args`]).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::{CanonicalEvent, DiagnosticLevel};
use crate::provider::{Invocation, Provider};
use crate::registry::RunId;

/// Length of locally synthesized session ids.
pub const SESSION_ID_LEN: usize = 26;

const SYNTHETIC_PREFIX: &str = "syn_";

pub const DEFAULT_SESSION_WINDOW: Duration = Duration::from_millis(3000);

/// A provider-side conversation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// A fresh local id: `syn_` followed by 22 hex characters.
    pub fn synthetic() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}{}",
            SYNTHETIC_PREFIX,
            &hex[..SESSION_ID_LEN - SYNTHETIC_PREFIX.len()]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_PREFIX)
    }

    /// True for 26-character tokens of `[A-Za-z0-9_-]`.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == SESSION_ID_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Errors when continuing a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} was never confirmed by its provider and cannot be resumed")]
    NotResumable(SessionId),
}

/// Which run serves a session, plus what a resume invocation needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub provider: Provider,
    pub cwd: PathBuf,
}

impl SessionRecord {
    /// The invocation that continues this session with a new prompt.
    pub fn resume_invocation(&self, prompt: impl Into<String>) -> Result<Invocation, SessionError> {
        if self.session_id.is_synthetic() {
            return Err(SessionError::NotResumable(self.session_id.clone()));
        }
        Ok(Invocation::new(self.provider, prompt).resume(self.session_id.clone()))
    }
}

// ============================================================================
// Session store boundary
// ============================================================================

/// Where session records outlive the runs that created them.
///
/// The on-disk format belongs to the host application; the supervisor only
/// records sessions as they are attached and looks them up to resume.
pub trait SessionStore: Send + Sync {
    fn record(&self, record: &SessionRecord);
    fn lookup(&self, session_id: &SessionId) -> Option<SessionRecord>;
    fn forget(&self, session_id: &SessionId);
}

/// Process-local [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn record(&self, record: &SessionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(record.session_id.clone(), record.clone());
        }
    }

    fn lookup(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.records.lock().ok()?.get(session_id).cloned()
    }

    fn forget(&self, session_id: &SessionId) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(session_id);
        }
    }
}

// ============================================================================
// SessionWatch
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchState {
    Waiting,
    Captured(SessionId),
    Synthetic(SessionId),
}

/// Tracks session capture for one run.
#[derive(Debug)]
pub struct SessionWatch {
    deadline: Instant,
    state: WatchState,
}

impl SessionWatch {
    pub fn new(window: Duration) -> Self {
        Self {
            deadline: Instant::now() + window,
            state: WatchState::Waiting,
        }
    }

    /// When the fallback fires, if still waiting.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            WatchState::Waiting => Some(self.deadline),
            _ => None,
        }
    }

    pub fn current(&self) -> Option<&SessionId> {
        match &self.state {
            WatchState::Waiting => None,
            WatchState::Captured(id) | WatchState::Synthetic(id) => Some(id),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.state, WatchState::Synthetic(_))
    }

    /// Inspect an outgoing event. Returns the id when it is new for this run,
    /// either the first capture or a hand-off to a different id.
    pub fn observe(&mut self, event: &CanonicalEvent) -> Option<SessionId> {
        let announced = SessionId::from(event.session_id()?);
        if self.current() == Some(&announced) {
            return None;
        }
        if let WatchState::Synthetic(previous) = &self.state {
            log::info!("Provider session {} replaces fallback {}", announced, previous);
        }
        self.state = WatchState::Captured(announced.clone());
        Some(announced)
    }

    /// Window elapsed without a provider id: switch to a synthetic one.
    ///
    /// Returns the events announcing it; empty when no longer waiting.
    pub fn expire(&mut self, provider: Provider) -> Vec<CanonicalEvent> {
        if self.state != WatchState::Waiting {
            return Vec::new();
        }
        let id = SessionId::synthetic();
        log::warn!(
            "{} did not report a session id in time, using fallback {}",
            provider,
            id
        );
        self.state = WatchState::Synthetic(id.clone());
        vec![
            CanonicalEvent::SessionBegin {
                session_id: id.0.clone(),
                provider,
                model: None,
            },
            CanonicalEvent::diagnostic(
                DiagnosticLevel::Warn,
                format!(
                    "{} did not report a session id; continuing with local id {} (resume unavailable)",
                    provider, id
                ),
            ),
        ]
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(id: &str) -> CanonicalEvent {
        CanonicalEvent::SessionBegin {
            session_id: id.to_string(),
            provider: Provider::Claude,
            model: None,
        }
    }

    mod session_id {
        use super::*;
        use std::collections::HashSet;

        #[test]
        fn synthetic_ids_are_well_formed() {
            let id = SessionId::synthetic();
            assert_eq!(id.as_str().len(), SESSION_ID_LEN);
            assert!(id.is_well_formed());
            assert!(id.is_synthetic());
        }

        #[test]
        fn synthetic_ids_are_unique() {
            let ids: HashSet<SessionId> = (0..100).map(|_| SessionId::synthetic()).collect();
            assert_eq!(ids.len(), 100);
        }

        #[test]
        fn well_formed_rejects_bad_tokens() {
            assert!(!SessionId::from("short").is_well_formed());
            assert!(!SessionId::from("abcdefghijklmnopqrstuvwxy!").is_well_formed());
            assert!(SessionId::from("abcdefghijklmnopqrstuvwx-_").is_well_formed());
        }

        #[test]
        fn serializes_as_plain_string() {
            let json = serde_json::to_string(&SessionId::from("abc")).unwrap();
            assert_eq!(json, "\"abc\"");
        }
    }

    mod watch {
        use super::*;

        #[tokio::test]
        async fn captures_first_session_begin() {
            let mut watch = SessionWatch::new(Duration::from_secs(5));
            assert!(watch.deadline().is_some());
            assert_eq!(watch.observe(&CanonicalEvent::text("x")), None);
            assert_eq!(watch.observe(&begin("s1")), Some(SessionId::from("s1")));
            assert_eq!(watch.observe(&begin("s1")), None);
            assert!(watch.deadline().is_none());
            assert!(watch.expire(Provider::Claude).is_empty());
        }

        #[tokio::test]
        async fn expiry_synthesizes_and_warns() {
            let mut watch = SessionWatch::new(Duration::ZERO);
            let events = watch.expire(Provider::Gemini);
            assert_eq!(events.len(), 2);
            let id = events[0].session_id().unwrap().to_string();
            assert!(id.starts_with("syn_"));
            assert!(matches!(
                events[1],
                CanonicalEvent::Diagnostic {
                    level: DiagnosticLevel::Warn,
                    ..
                }
            ));
            assert!(watch.is_degraded());
            assert_eq!(watch.current().map(SessionId::as_str), Some(id.as_str()));
        }

        #[tokio::test]
        async fn late_provider_id_replaces_fallback() {
            let mut watch = SessionWatch::new(Duration::ZERO);
            watch.expire(Provider::Claude);
            assert_eq!(watch.observe(&begin("real")), Some(SessionId::from("real")));
            assert!(!watch.is_degraded());
        }
    }

    mod resume {
        use super::*;

        fn record(id: SessionId) -> SessionRecord {
            SessionRecord {
                session_id: id,
                run_id: RunId(7),
                provider: Provider::Claude,
                cwd: PathBuf::from("/tmp"),
            }
        }

        #[test]
        fn builds_resume_invocation() {
            let invocation = record(SessionId::from("abc"))
                .resume_invocation("next")
                .unwrap();
            assert_eq!(invocation.resume, Some(SessionId::from("abc")));
            assert_eq!(&invocation.build_args()[..2], &["--resume", "abc"]);
        }

        #[test]
        fn synthetic_sessions_cannot_resume() {
            let err = record(SessionId::synthetic())
                .resume_invocation("next")
                .unwrap_err();
            assert!(matches!(err, SessionError::NotResumable(_)));
        }

        #[test]
        fn memory_store_round_trip() {
            let store = MemorySessionStore::new();
            let rec = record(SessionId::from("keep"));
            store.record(&rec);
            assert_eq!(store.lookup(&SessionId::from("keep")), Some(rec));
            store.forget(&SessionId::from("keep"));
            assert_eq!(store.lookup(&SessionId::from("keep")), None);
        }
    }
}
