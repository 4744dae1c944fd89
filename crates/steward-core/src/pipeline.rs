//! Per-run streaming task.
//!
//! One pipeline owns a run's stdout reader and adapter. Stderr is read by a
//! sibling task and handed over on a small channel so both pipes keep
//! draining. The pipeline:
//!
//! 1. turns stdout frames into canonical events and forwards them, in order,
//!    to the run's [`EventSender`]
//! 2. captures the session id (or falls back to a synthetic one) and attaches
//!    it to the registry entry
//! 3. after stdout closes, polls the registry until the process is reaped and
//!    reports how it exited
//!
//! Every send suspends until the consumer makes room. Only a cancelled run
//! bounds its last send by the grace period. Cancellation comes from
//! [`Registry::terminate`] or supervisor shutdown; a sweep that reaps an
//! exited child leaves the pipeline running and hands it the exit status.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::EventSender;
use crate::event::{CanonicalEvent, DiagnosticLevel, FailureKind, RunEvent};
use crate::logging::{log_line, open_log_file, Channel, LogHandle};
use crate::normalize::Adapter;
use crate::process::RunExit;
use crate::provider::Provider;
use crate::reader::{FrameReader, Framing, ReaderItem};
use crate::registry::{ReapStatus, Registry, RunId, REAP_POLL};
use crate::session::{SessionId, SessionWatch};

/// Stderr lines buffered between the stderr task and the pipeline.
const STDERR_QUEUE: usize = 64;

/// How long to keep collecting stderr once the process has exited.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

/// Stderr lines quoted in an exit-status failure.
const FAILURE_TAIL_LINES: usize = 20;

/// Undecodable stdout text is quoted up to this many characters.
const QUOTE_LIMIT: usize = 200;

/// Reader and timing settings for one run.
#[derive(Debug, Clone)]
pub(crate) struct PipelineSettings {
    pub read_buffer_size: usize,
    pub frame_ceiling: usize,
    pub session_window: Duration,
    pub grace: Duration,
    pub tail_lines: usize,
    pub log_dir: Option<PathBuf>,
}

/// Why streaming stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    ConsumerGone,
}

struct Pipeline {
    run_id: RunId,
    provider: Provider,
    registry: Arc<Registry>,
    adapter: Adapter,
    watch: SessionWatch,
    sender: EventSender,
    cancel: CancellationToken,
    grace: Duration,
    session: Option<String>,
    stderr_tail: VecDeque<String>,
    tail_lines: usize,
    transcript: Option<LogHandle>,
}

/// Start streaming a registered run. The returned task ends once the final
/// event was delivered (or the consumer went away).
#[allow(clippy::too_many_arguments)]
pub(crate) fn start<O, E>(
    run_id: RunId,
    provider: Provider,
    registry: Arc<Registry>,
    stdout: O,
    stderr: E,
    sender: EventSender,
    cancel: CancellationToken,
    settings: PipelineSettings,
) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let stderr_rx = spawn_stderr_reader(run_id, stderr, &settings);
    let stdout = FrameReader::with_limits(
        stdout,
        Framing::Json,
        settings.read_buffer_size,
        settings.frame_ceiling,
    );

    let pipeline = Pipeline {
        run_id,
        provider,
        registry,
        adapter: Adapter::for_provider(provider),
        watch: SessionWatch::new(settings.session_window),
        sender,
        cancel,
        grace: settings.grace,
        session: None,
        stderr_tail: VecDeque::new(),
        tail_lines: settings.tail_lines.min(FAILURE_TAIL_LINES),
        transcript: settings
            .log_dir
            .as_deref()
            .map(|dir| open_log_file(Some(dir), run_id)),
    };

    tokio::spawn(pipeline.run(stdout, stderr_rx))
}

fn spawn_stderr_reader<E>(run_id: RunId, stderr: E, settings: &PipelineSettings) -> mpsc::Receiver<String>
where
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STDERR_QUEUE);
    let mut reader = FrameReader::with_limits(
        stderr,
        Framing::Lines,
        settings.read_buffer_size,
        settings.frame_ceiling,
    );
    tokio::spawn(async move {
        while let Some(item) = reader.next().await {
            let line = match item {
                ReaderItem::Line(line) => line,
                ReaderItem::Oversized { ceiling } => {
                    format!("(stderr line longer than {} bytes discarded)", ceiling)
                }
                ReaderItem::Failed(e) => {
                    log::debug!("{} stderr read failed: {}", run_id, e);
                    break;
                }
                ReaderItem::Frame(_) | ReaderItem::Undecodable(_) => continue,
            };
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Pipeline {
    async fn run<O>(mut self, mut stdout: FrameReader<O>, mut stderr: mpsc::Receiver<String>)
    where
        O: AsyncRead + Unpin,
    {
        let mut stderr_open = true;
        let result = match self.stream(&mut stdout, &mut stderr, &mut stderr_open).await {
            Ok(()) => self.wait_for_exit(&mut stderr, &mut stderr_open).await,
            Err(stop) => Err(stop),
        };
        drop(stdout);

        match result {
            Ok(exit) => {
                self.drain_stderr(&mut stderr, stderr_open).await;
                self.report_exit(exit).await;
            }
            Err(Stop::Cancelled) => {
                log::info!("{} cancelled", self.run_id);
                let event = self.envelope(CanonicalEvent::failure(
                    FailureKind::Terminated,
                    "run was terminated before it finished",
                ));
                if tokio::time::timeout(self.grace, self.sender.send(event)).await.is_err() {
                    log::warn!("{} consumer stalled; termination event dropped", self.run_id);
                }
            }
            Err(Stop::ConsumerGone) => {
                log::info!("{} consumer went away, terminating", self.run_id);
                self.registry.terminate(self.run_id, self.grace).await;
            }
        }
        log::debug!("{} pipeline finished", self.run_id);
    }

    /// Forward stdout until it closes.
    async fn stream<O>(
        &mut self,
        stdout: &mut FrameReader<O>,
        stderr: &mut mpsc::Receiver<String>,
        stderr_open: &mut bool,
    ) -> Result<(), Stop>
    where
        O: AsyncRead + Unpin,
    {
        loop {
            let deadline = self.watch.deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                _ = sleep_until_some(deadline) => self.fall_back_session().await?,
                line = stderr.recv(), if *stderr_open => match line {
                    Some(line) => self.stderr_line(line).await?,
                    None => *stderr_open = false,
                },
                item = stdout.next() => match item {
                    Some(item) => self.handle_item(item).await?,
                    None => break,
                },
            }
        }

        for event in self.adapter.finish() {
            self.emit(event).await?;
        }
        // Nothing more can announce a session once stdout is closed.
        if self.watch.deadline().is_some() {
            self.fall_back_session().await?;
        }
        Ok(())
    }

    async fn handle_item(&mut self, item: ReaderItem) -> Result<(), Stop> {
        match item {
            ReaderItem::Frame(frame) => {
                log::trace!("{} frame: {}", self.run_id, frame);
                self.transcribe(Channel::Stdout, || frame.to_string());
                for event in self.adapter.translate(&frame) {
                    self.emit(event).await?;
                }
                Ok(())
            }
            ReaderItem::Undecodable(text) | ReaderItem::Line(text) => {
                self.transcribe(Channel::Stdout, || text.clone());
                let quoted: String = text.chars().take(QUOTE_LIMIT).collect();
                self.emit(CanonicalEvent::diagnostic(
                    DiagnosticLevel::Warn,
                    format!("undecodable {} output: {}", self.provider, quoted),
                ))
                .await
            }
            ReaderItem::Oversized { ceiling } => {
                log::warn!("{} discarded a frame over {} bytes", self.run_id, ceiling);
                self.emit(CanonicalEvent::failure(
                    FailureKind::OversizedFrame,
                    format!("frame exceeded {} bytes and was discarded", ceiling),
                ))
                .await
            }
            ReaderItem::Failed(e) => {
                log::error!("{} stdout read failed: {}", self.run_id, e);
                self.emit(CanonicalEvent::failure(FailureKind::Stream, e)).await
            }
        }
    }

    async fn stderr_line(&mut self, line: String) -> Result<(), Stop> {
        log::debug!("{} stderr: {}", self.run_id, line);
        self.transcribe(Channel::Stderr, || line.clone());
        self.registry.push_diagnostic(self.run_id, &line);
        self.remember_stderr(&line);
        self.emit(CanonicalEvent::diagnostic(DiagnosticLevel::Info, line)).await
    }

    fn remember_stderr(&mut self, line: &str) {
        if self.tail_lines == 0 {
            return;
        }
        if self.stderr_tail.len() == self.tail_lines {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line.to_string());
    }

    async fn fall_back_session(&mut self) -> Result<(), Stop> {
        let events = self.watch.expire(self.provider);
        if let Some(id) = self.watch.current().cloned() {
            self.adopt_session(id);
        }
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }

    fn adopt_session(&mut self, id: SessionId) {
        self.session = Some(id.0.clone());
        if !self.registry.attach_session(self.run_id, id) {
            log::debug!("{} is no longer registered; session not attached", self.run_id);
        }
    }

    /// Poll until the process is reaped, still forwarding stderr.
    async fn wait_for_exit(
        &mut self,
        stderr: &mut mpsc::Receiver<String>,
        stderr_open: &mut bool,
    ) -> Result<RunExit, Stop> {
        loop {
            match self.registry.try_reap(self.run_id) {
                ReapStatus::Exited(exit) => return Ok(exit),
                // Only termination removes an entry without leaving its exit.
                ReapStatus::Missing => return Err(Stop::Cancelled),
                ReapStatus::Running => {}
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                line = stderr.recv(), if *stderr_open => match line {
                    Some(line) => self.stderr_line(line).await?,
                    None => *stderr_open = false,
                },
                _ = tokio::time::sleep(REAP_POLL) => {}
            }
        }
    }

    async fn drain_stderr(&mut self, stderr: &mut mpsc::Receiver<String>, open: bool) {
        if !open {
            return;
        }
        let deadline = Instant::now() + STDERR_DRAIN;
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, stderr.recv()).await {
            log::debug!("{} stderr: {}", self.run_id, line);
            self.transcribe(Channel::Stderr, || line.clone());
            self.remember_stderr(&line);
            if !self.deliver(CanonicalEvent::diagnostic(DiagnosticLevel::Info, line)).await {
                return;
            }
        }
    }

    async fn report_exit(&mut self, exit: RunExit) {
        let event = if exit.success() {
            if self.adapter.turn_completed() {
                return;
            }
            CanonicalEvent::TurnComplete {}
        } else {
            log::warn!("{} {} exited with {}", self.run_id, self.provider, exit.describe());
            CanonicalEvent::failure(FailureKind::ExitStatus, self.exit_detail(&exit.describe()))
        };
        self.deliver(event).await;
    }

    fn exit_detail(&self, status: &str) -> String {
        let mut detail = format!("{} exited with {}", self.provider, status);
        if !self.stderr_tail.is_empty() {
            detail.push_str("; stderr:\n");
            detail.push_str(&Vec::from(self.stderr_tail.clone()).join("\n"));
        }
        detail
    }

    fn transcribe(&self, channel: Channel, data: impl FnOnce() -> String) {
        if let Some(handle) = &self.transcript {
            log_line(handle, channel, &data());
        }
    }

    fn envelope(&mut self, event: CanonicalEvent) -> RunEvent {
        let run_event = RunEvent::new(self.run_id, self.session.clone(), event);
        if self.transcript.is_some() {
            if let Ok(wire) = run_event.to_wire() {
                self.transcribe(Channel::Event, || wire);
            }
        }
        run_event
    }

    /// Send while the run is live: waits for channel room, gives up on cancel.
    async fn emit(&mut self, event: CanonicalEvent) -> Result<(), Stop> {
        if let Some(id) = self.watch.observe(&event) {
            self.adopt_session(id);
        }
        let run_event = self.envelope(event);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            sent = self.sender.send(run_event) => sent.map_err(|_| Stop::ConsumerGone),
        }
    }

    /// Send after the process is gone. Waits for channel room however long
    /// the consumer takes; false once the consumer has dropped its stream.
    async fn deliver(&mut self, event: CanonicalEvent) -> bool {
        let run_event = self.envelope(event);
        self.sender.send(run_event).await.is_ok()
    }
}
