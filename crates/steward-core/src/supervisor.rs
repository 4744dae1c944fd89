//! The host-facing entry point.
//!
//! [`Supervisor`] ties the pieces together: it locates the provider binary,
//! builds the command line, spawns and registers the child, and starts the
//! run's pipeline. Callers get a [`RunHandle`] whose [`EventStream`] yields
//! canonical events until the run ends.
//!
//! ```no_run
//! # async fn demo() -> Result<(), steward_core::Error> {
//! use steward_core::{Provider, Supervisor, SupervisorConfig, TurnRequest};
//!
//! let supervisor = Supervisor::new(SupervisorConfig::load_default()?);
//! let mut run = supervisor
//!     .spawn(TurnRequest::new(Provider::Claude, "explain this repo", "."))
//!     .await?;
//! while let Some(event) = run.events.recv().await {
//!     println!("{}", event.to_wire().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channel::{event_channel, EventStream};
use crate::config::SupervisorConfig;
use crate::locator::{CachedLocator, Locator, LocatorError};
use crate::pipeline::{self, PipelineSettings};
use crate::process::{spawn_with_retry, SpawnConfig, SpawnError};
use crate::provider::{Invocation, Provider};
use crate::registry::{ProcessHandle, ProcessInfo, Registry, RunId, SweepReport, TerminateOutcome};
use crate::session::{MemorySessionStore, SessionError, SessionId, SessionStore};

/// Characters of the prompt kept as the default task description.
const TASK_PREVIEW_CHARS: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Locate(#[from] LocatorError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("{provider} process started without a {pipe} pipe")]
    MissingPipe {
        provider: Provider,
        pipe: &'static str,
    },

    #[error("Working directory does not exist: {}", .0.display())]
    InvalidWorkingDir(PathBuf),

    #[error("No run or stored record for session {0}")]
    UnknownSession(SessionId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

/// One turn to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub provider: Provider,
    pub prompt: String,
    pub cwd: PathBuf,
    pub resume: Option<SessionId>,
    pub model: Option<String>,
    /// Short human description; defaults to the start of the prompt.
    pub task: Option<String>,
    pub extra_args: Vec<String>,
}

impl TurnRequest {
    pub fn new(provider: Provider, prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            prompt: prompt.into(),
            cwd: cwd.into(),
            resume: None,
            model: None,
            task: None,
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

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn invocation(&self) -> Invocation {
        let mut invocation =
            Invocation::new(self.provider, self.prompt.clone()).extra_args(self.extra_args.clone());
        if let Some(session_id) = &self.resume {
            invocation = invocation.resume(session_id.clone());
        }
        if let Some(model) = &self.model {
            invocation = invocation.model(model.clone());
        }
        invocation
    }

    fn task_description(&self) -> String {
        match &self.task {
            Some(task) => task.clone(),
            None => {
                let first_line = self.prompt.lines().next().unwrap_or_default();
                first_line.chars().take(TASK_PREVIEW_CHARS).collect()
            }
        }
    }
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    pub events: EventStream,
}

/// Either key a run can be addressed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Run(RunId),
    Session(SessionId),
}

impl From<RunId> for RunTarget {
    fn from(run_id: RunId) -> Self {
        RunTarget::Run(run_id)
    }
}

impl From<SessionId> for RunTarget {
    fn from(session_id: SessionId) -> Self {
        RunTarget::Session(session_id)
    }
}

/// Spawns, tracks and tears down provider runs.
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    locator: CachedLocator,
    registry: Arc<Registry>,
    store: Arc<dyn SessionStore>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// A supervisor with an in-memory session store.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_store(config, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_store(config: SupervisorConfig, store: Arc<dyn SessionStore>) -> Self {
        let locator = CachedLocator::new(Locator::from_config(&config));
        Self::with_locator(config, locator, store)
    }

    pub fn with_locator(config: SupervisorConfig, locator: CachedLocator, store: Arc<dyn SessionStore>) -> Self {
        Self {
            config: Arc::new(config),
            locator,
            registry: Arc::new(Registry::new(Arc::clone(&store))),
            store,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start one turn.
    ///
    /// The child is registered before any of its output is read, so the run
    /// can be listed and terminated as soon as this returns.
    pub async fn spawn(&self, request: TurnRequest) -> Result<RunHandle, SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        if !request.cwd.is_dir() {
            return Err(SupervisorError::InvalidWorkingDir(request.cwd));
        }

        let provider = request.provider;
        let binary = self.locator.locate(provider)?;
        let args = request.invocation().build_args();
        log::info!(
            "Spawning {} in {}: {} {}",
            provider,
            request.cwd.display(),
            binary.display(),
            args.join(" ")
        );

        let spawn_config = SpawnConfig::new(&binary, args)
            .working_dir(&request.cwd)
            .shell_prefix(self.config.shell_prefix.clone());
        let mut child = spawn_with_retry(&spawn_config, self.config.retry_policy()).await?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let cancel = self.shutdown.child_token();
        // Dropping the handle kills the child, so a missing pipe cleans up after itself.
        let handle = ProcessHandle::new(child, cancel.clone(), self.config.stderr_tail_lines);
        let (stdout, stderr) = match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            (None, _) => return Err(SupervisorError::MissingPipe { provider, pipe: "stdout" }),
            (_, None) => return Err(SupervisorError::MissingPipe { provider, pipe: "stderr" }),
        };

        let info = self
            .registry
            .register(provider, request.cwd.clone(), request.task_description(), handle);

        if let Some(session_id) = request.resume.clone() {
            self.registry.attach_session(info.run_id, session_id);
        }

        let (sender, events) = event_channel(self.config.channel_capacity);
        pipeline::start(
            info.run_id,
            provider,
            Arc::clone(&self.registry),
            stdout,
            stderr,
            sender,
            cancel,
            self.pipeline_settings(),
        );

        Ok(RunHandle {
            run_id: info.run_id,
            events,
        })
    }

    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            read_buffer_size: self.config.read_buffer_size,
            frame_ceiling: self.config.frame_ceiling,
            session_window: self.config.session_window(),
            grace: self.config.grace(),
            tail_lines: self.config.stderr_tail_lines,
            log_dir: self.config.log_dir.clone(),
        }
    }

    /// Continue a conversation with a new prompt.
    ///
    /// A run still serving the session is terminated first; two processes
    /// never write to the same provider session.
    pub async fn resume(&self, session_id: SessionId, prompt: impl Into<String>) -> Result<RunHandle, SupervisorError> {
        if session_id.is_synthetic() {
            return Err(SessionError::NotResumable(session_id).into());
        }
        let live = self.registry.lookup_session(&session_id);
        let record = live
            .clone()
            .or_else(|| self.store.lookup(&session_id))
            .ok_or_else(|| SupervisorError::UnknownSession(session_id.clone()))?;

        if let Some(live) = live {
            log::info!("Stopping {} before resuming session {}", live.run_id, session_id);
            self.registry.terminate(live.run_id, self.config.grace()).await;
        }

        let invocation = record.resume_invocation(prompt)?;
        let mut request = TurnRequest::new(record.provider, invocation.prompt, record.cwd)
            .extra_args(invocation.extra_args);
        request.resume = invocation.resume;
        self.spawn(request).await
    }

    /// Make `run_id` addressable by `session_id`. False for unknown runs.
    pub fn attach_session(&self, run_id: RunId, session_id: SessionId) -> bool {
        self.registry.attach_session(run_id, session_id)
    }

    pub fn lookup_session(&self, session_id: &SessionId) -> Option<RunId> {
        self.registry.lookup_session(session_id).map(|record| record.run_id)
    }

    /// Drop a session from the persistent store; a live run keeps it.
    pub fn forget_session(&self, session_id: &SessionId) {
        self.store.forget(session_id);
    }

    /// Stop a run, escalating to SIGKILL after the configured grace period.
    pub async fn terminate(&self, target: impl Into<RunTarget>) -> TerminateOutcome {
        let run_id = match target.into() {
            RunTarget::Run(run_id) => Some(run_id),
            RunTarget::Session(session_id) => self.lookup_session(&session_id),
        };
        match run_id {
            Some(run_id) => self.registry.terminate(run_id, self.config.grace()).await,
            None => TerminateOutcome::AlreadyGone,
        }
    }

    /// Reap exited runs, expire runs past `maxRunAgeSecs`, and drop stale
    /// session records.
    pub async fn sweep_orphans(&self) -> SweepReport {
        sweep(&self.registry, &self.config).await
    }

    /// Run [`Supervisor::sweep_orphans`] every `sweepIntervalSecs` until
    /// [`Supervisor::shutdown_all`] is called.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep(&registry, &config).await;
                    }
                }
            }
            log::debug!("Sweeper stopped");
        })
    }

    /// Terminate every run concurrently and refuse new spawns.
    pub async fn shutdown_all(&self) -> Vec<(RunId, TerminateOutcome)> {
        log::info!("Shutting down {} run(s)", self.registry.len());
        self.shutdown.cancel();
        self.registry.shutdown_all(self.config.grace()).await
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.registry.list()
    }

    pub fn info(&self, run_id: RunId) -> Option<ProcessInfo> {
        self.registry.info(run_id)
    }

    pub fn is_running(&self, run_id: RunId) -> bool {
        self.registry.contains(run_id)
    }

    /// Most recent stderr lines of a live run.
    pub fn diagnostics(&self, run_id: RunId) -> Vec<String> {
        self.registry.diagnostics(run_id)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep(registry: &Registry, config: &SupervisorConfig) -> SweepReport {
    let report = registry.sweep(config.max_run_age(), config.grace()).await;
    if !report.is_empty() {
        log::info!(
            "Sweep: {} reaped, {} expired, {} stale sessions",
            report.reaped.len(),
            report.expired.len(),
            report.stale_sessions.len()
        );
    }
    report
}
