//! The run registry: single source of truth for what is running.
//!
//! Every spawned child is registered here before its output is read, and its
//! entry is removed exactly once, when the process has been reaped. The
//! registry is the sole owner of each child handle; everything else refers to
//! a run by [`RunId`].
//!
//! All mutation goes through one `std::sync::Mutex`. The lock is never held
//! across an `.await`: waits are short sleeps between `try_wait` polls.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::process::{signal_group, RunExit, Signal};
use crate::provider::Provider;
use crate::session::{SessionId, SessionRecord, SessionStore};

/// Interval between exit polls while waiting for a process.
pub const REAP_POLL: Duration = Duration::from_millis(25);

/// Upper bound on waiting for the OS after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Locally unique run identifier. Never reused within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Immutable facts about a run, fixed at spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub run_id: RunId,
    pub provider: Provider,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub cwd: PathBuf,
    pub task: String,
}

/// Live process state owned by a registry entry.
///
/// Dropping the handle kills the process group and cancels the run if the
/// child is still running. A handle for an exited child drops quietly so its
/// pipeline can finish delivering buffered output.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    cancel: CancellationToken,
    stderr_tail: VecDeque<String>,
    tail_limit: usize,
}

impl ProcessHandle {
    pub fn new(child: Child, cancel: CancellationToken, tail_limit: usize) -> Self {
        Self {
            child,
            cancel,
            stderr_tail: VecDeque::with_capacity(tail_limit.min(64)),
            tail_limit,
        }
    }

    fn push_diagnostic(&mut self, line: String) {
        if self.tail_limit == 0 {
            return;
        }
        if self.stderr_tail.len() == self.tail_limit {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        self.cancel.cancel();
        if let Some(pid) = self.child.id() {
            signal_group(pid, Signal::Kill);
        }
        let _ = self.child.start_kill();
    }
}

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Terminating,
}

/// Result of [`Registry::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateOutcome {
    /// Exited within the grace period.
    Graceful,
    /// Had to be killed.
    Forced,
    /// Nothing to do: unknown, already reaped, or already being terminated.
    AlreadyGone,
}

/// Result of polling a run's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapStatus {
    Running,
    /// Exited and removed from the registry.
    Exited(RunExit),
    /// No entry (already removed, or terminated).
    Missing,
}

/// Summary of one orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub reaped: Vec<RunId>,
    pub expired: Vec<RunId>,
    pub stale_sessions: Vec<SessionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.expired.is_empty() && self.stale_sessions.is_empty()
    }
}

struct RunEntry {
    info: ProcessInfo,
    handle: ProcessHandle,
    state: RunState,
    session: Option<SessionId>,
}

#[derive(Default)]
struct Table {
    runs: HashMap<RunId, RunEntry>,
    sessions: HashMap<SessionId, SessionRecord>,
    /// Exit statuses of runs reaped by a sweep, held for their pipeline.
    unclaimed: HashMap<RunId, RunExit>,
}

impl Table {
    /// Remove a run and any session record pointing at it.
    fn remove(&mut self, run_id: RunId) -> Option<RunEntry> {
        let entry = self.runs.remove(&run_id)?;
        if let Some(session_id) = &entry.session {
            if self.sessions.get(session_id).map(|r| r.run_id) == Some(run_id) {
                self.sessions.remove(session_id);
            }
        }
        Some(entry)
    }
}

/// Registry of supervised runs.
pub struct Registry {
    table: Mutex<Table>,
    next_id: AtomicU64,
    store: Arc<dyn SessionStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            next_id: AtomicU64::new(1),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Every mutation is a single map operation; a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of a freshly spawned child under a new run id.
    pub fn register(
        &self,
        provider: Provider,
        cwd: PathBuf,
        task: String,
        handle: ProcessHandle,
    ) -> ProcessInfo {
        let run_id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = ProcessInfo {
            run_id,
            provider,
            pid: handle.child.id(),
            started_at: Utc::now(),
            cwd,
            task,
        };
        log::info!(
            "Registered {} ({}, pid {:?})",
            run_id,
            provider,
            info.pid
        );
        self.lock().runs.insert(
            run_id,
            RunEntry {
                info: info.clone(),
                handle,
                state: RunState::Running,
                session: None,
            },
        );
        info
    }

    /// Make the run addressable by `session_id`.
    ///
    /// If another run already served that session, the record moves to this
    /// run. Returns false when the run is not registered.
    pub fn attach_session(&self, run_id: RunId, session_id: SessionId) -> bool {
        let record = {
            let mut table = self.lock();
            let Some(entry) = table.runs.get_mut(&run_id) else {
                return false;
            };
            let previous = entry.session.replace(session_id.clone());
            let record = SessionRecord {
                session_id: session_id.clone(),
                run_id,
                provider: entry.info.provider,
                cwd: entry.info.cwd.clone(),
            };

            if let Some(previous) = previous.filter(|p| *p != session_id) {
                table.sessions.remove(&previous);
            }
            if let Some(old) = table.sessions.insert(session_id.clone(), record.clone()) {
                if old.run_id != run_id {
                    log::info!("Session {} handed off from {} to {}", session_id, old.run_id, run_id);
                    if let Some(old_entry) = table.runs.get_mut(&old.run_id) {
                        old_entry.session = None;
                    }
                }
            }
            record
        };
        self.store.record(&record);
        true
    }

    pub fn lookup_session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn info(&self, run_id: RunId) -> Option<ProcessInfo> {
        self.lock().runs.get(&run_id).map(|e| e.info.clone())
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.lock().runs.contains_key(&run_id)
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self.lock().runs.values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|i| i.run_id);
        infos
    }

    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one stderr line to the run's bounded diagnostic buffer.
    pub fn push_diagnostic(&self, run_id: RunId, line: &str) {
        if let Some(entry) = self.lock().runs.get_mut(&run_id) {
            entry.handle.push_diagnostic(line.to_string());
        }
    }

    /// Most recent stderr lines, oldest first.
    pub fn diagnostics(&self, run_id: RunId) -> Vec<String> {
        self.lock()
            .runs
            .get(&run_id)
            .map(|e| e.handle.stderr_tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Poll the process once; an exited run is removed.
    ///
    /// A run reaped earlier by [`Registry::sweep`] reports its exit here once.
    pub fn try_reap(&self, run_id: RunId) -> ReapStatus {
        self.reap(run_id, false)
    }

    fn reap(&self, run_id: RunId, hold_exit: bool) -> ReapStatus {
        let (entry, exit) = {
            let mut table = self.lock();
            let Some(entry) = table.runs.get_mut(&run_id) else {
                return match table.unclaimed.remove(&run_id) {
                    Some(exit) => ReapStatus::Exited(exit),
                    None => ReapStatus::Missing,
                };
            };
            match entry.handle.child.try_wait() {
                Ok(None) => return ReapStatus::Running,
                Ok(Some(status)) => {
                    let exit = RunExit::from(status);
                    if hold_exit {
                        table.unclaimed.insert(run_id, exit);
                    }
                    (table.remove(run_id), exit)
                }
                Err(e) => {
                    log::warn!("Failed to poll {}: {}", run_id, e);
                    return ReapStatus::Running;
                }
            }
        };
        log::info!("{} exited with {}", run_id, exit.describe());
        drop(entry);
        ReapStatus::Exited(exit)
    }

    /// Stop a run: SIGTERM to its process group, wait up to `grace`, then
    /// SIGKILL. The entry is always removed and the process reaped.
    ///
    /// Calling this on an unknown, finished, or already-terminating run is a
    /// no-op returning [`TerminateOutcome::AlreadyGone`].
    pub async fn terminate(&self, run_id: RunId, grace: Duration) -> TerminateOutcome {
        let (pid, cancel) = {
            let mut table = self.lock();
            let Some(entry) = table.runs.get_mut(&run_id) else {
                table.unclaimed.remove(&run_id);
                return TerminateOutcome::AlreadyGone;
            };
            if entry.state == RunState::Terminating {
                return TerminateOutcome::AlreadyGone;
            }
            entry.state = RunState::Terminating;
            (entry.handle.child.id(), entry.handle.cancel.clone())
        };

        log::info!("Terminating {}", run_id);
        cancel.cancel();
        self.send_signal(run_id, pid, Signal::Terminate);

        if self.wait_for_exit(run_id, grace).await {
            return TerminateOutcome::Graceful;
        }

        log::warn!("{} ignored SIGTERM for {:?}, killing", run_id, grace);
        self.send_signal(run_id, pid, Signal::Kill);
        if !self.wait_for_exit(run_id, KILL_WAIT).await {
            log::error!("{} still present after SIGKILL, dropping handle", run_id);
            let entry = self.lock().remove(run_id);
            drop(entry);
        }
        TerminateOutcome::Forced
    }

    fn send_signal(&self, run_id: RunId, pid: Option<u32>, signal: Signal) {
        let mut table = self.lock();
        let Some(entry) = table.runs.get_mut(&run_id) else {
            return;
        };
        // Only signal while the child is unreaped so the pid cannot have been reused.
        if !matches!(entry.handle.child.try_wait(), Ok(None)) {
            return;
        }
        let delivered = pid.map(|pid| signal_group(pid, signal)).unwrap_or(false);
        if !delivered || signal == Signal::Kill {
            if let Err(e) = entry.handle.child.start_kill() {
                log::debug!("start_kill on {} failed: {}", run_id, e);
            }
        }
    }

    /// Poll until the run is reaped or `limit` elapses. True when gone.
    async fn wait_for_exit(&self, run_id: RunId, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            match self.try_reap(run_id) {
                ReapStatus::Exited(_) | ReapStatus::Missing => return true,
                ReapStatus::Running => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(REAP_POLL.min(deadline - now)).await;
        }
    }

    /// Reap exited runs, terminate runs older than `max_age`, and drop session
    /// records that point at missing runs.
    pub async fn sweep(&self, max_age: Option<Duration>, grace: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let ids: Vec<RunId> = self.lock().runs.keys().copied().collect();
        for run_id in ids {
            if let ReapStatus::Exited(exit) = self.reap(run_id, true) {
                log::info!("Sweep reaped {} ({})", run_id, exit.describe());
                report.reaped.push(run_id);
            }
        }

        if let Some(max_age) = max_age {
            let now = Utc::now();
            let expired: Vec<RunId> = self
                .lock()
                .runs
                .values()
                .filter(|e| e.state == RunState::Running)
                .filter(|e| {
                    (now - e.info.started_at)
                        .to_std()
                        .map(|age| age > max_age)
                        .unwrap_or(false)
                })
                .map(|e| e.info.run_id)
                .collect();
            for run_id in expired {
                log::warn!("{} exceeded max age {:?}", run_id, max_age);
                if self.terminate(run_id, grace).await != TerminateOutcome::AlreadyGone {
                    report.expired.push(run_id);
                }
            }
        }

        {
            let mut table = self.lock();
            let Table { runs, sessions, .. } = &mut *table;
            sessions.retain(|session_id, record| {
                let live = runs.contains_key(&record.run_id);
                if !live {
                    report.stale_sessions.push(session_id.clone());
                }
                live
            });
        }

        report.reaped.sort();
        report.expired.sort();
        report
    }

    /// Terminate every registered run concurrently.
    pub async fn shutdown_all(self: &Arc<Self>, grace: Duration) -> Vec<(RunId, TerminateOutcome)> {
        let ids: Vec<RunId> = self.lock().runs.keys().copied().collect();
        let mut set = JoinSet::new();
        for run_id in ids {
            let registry = Arc::clone(self);
            set.spawn(async move { (run_id, registry.terminate(run_id, grace).await) });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => log::error!("Shutdown task failed: {}", e),
            }
        }

        // Anything registered while shutting down is dropped (and killed) here.
        let leftovers: Vec<RunEntry> = {
            let mut table = self.lock();
            table.sessions.clear();
            table.unclaimed.clear();
            table.runs.drain().map(|(_, entry)| entry).collect()
        };
        drop(leftovers);

        outcomes.sort_by_key(|(id, _)| *id);
        outcomes
    }
}

// ============================================================================
// TESTS
// ============================================================================
