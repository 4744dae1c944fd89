//! Child process launching and signalling.
//!
//! This module knows how to turn a [`SpawnConfig`] into a running
//! `tokio::process::Child`:
//! - stdout and stderr piped, stdin closed (prompts travel as arguments)
//! - the child leads its own process group so the whole tree can be signalled
//! - optional wrapping in a login shell (e.g. `/bin/zsh -l -c`) for setups
//!   where the provider only works with the user's shell environment
//! - transient resource exhaustion retried with bounded exponential backoff

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::process::{Child, Command};

/// How a run's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl RunExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit status {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

impl From<ExitStatus> for RunExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Errors starting a child process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Executable not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied executing {0}")]
    PermissionDenied(PathBuf),

    #[error("Out of process resources spawning {path}: {source}")]
    ResourceExhausted {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    /// Classify an I/O error from `Command::spawn`.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SpawnError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(path.to_path_buf()),
            _ if is_resource_exhaustion(&err) => SpawnError::ResourceExhausted {
                path: path.to_path_buf(),
                source: err,
            },
            _ => SpawnError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    /// Worth retrying after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpawnError::ResourceExhausted { .. })
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
}

// ============================================================================
// SpawnConfig
// ============================================================================

/// Configuration for spawning a provider process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Resolved path to the provider binary
    pub binary_path: PathBuf,
    /// Arguments to pass to the binary
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
    /// Shell prefix such as "/bin/zsh -l -c"; `None` executes directly
    pub shell_prefix: Option<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(binary_path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
            working_dir: None,
            shell_prefix: None,
            env: Vec::new(),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell_prefix(mut self, prefix: Option<String>) -> Self {
        self.shell_prefix = prefix.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Bounded exponential backoff for transient spawn failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based), with up to 50% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter_ms = (exp.as_millis() as u64) / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Build the command without spawning it.
pub fn build_command(config: &SpawnConfig) -> Result<Command, SpawnError> {
    let mut cmd = match &config.shell_prefix {
        Some(prefix) => wrap_in_shell(prefix, &config.binary_path, &config.args)?,
        None => {
            let mut cmd = Command::new(&config.binary_path);
            cmd.args(&config.args);
            cmd
        }
    };

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, &config.binary_path);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    Ok(cmd)
}

/// Spawn, retrying transient failures per `policy`.
pub async fn spawn_with_retry(config: &SpawnConfig, policy: RetryPolicy) -> Result<Child, SpawnError> {
    let mut attempt = 0;
    loop {
        let mut cmd = build_command(config)?;
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(e) => {
                let err = SpawnError::from_io(e, &config.binary_path);
                if !err.is_transient() || attempt >= policy.retries {
                    return Err(err);
                }
                attempt += 1;
                let delay = policy.delay(attempt);
                log::warn!(
                    "Spawn of {} failed ({}), retry {}/{} in {:?}",
                    config.binary_path.display(),
                    err,
                    attempt,
                    policy.retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `<prefix> '<quoted command>'`, e.g. `/bin/zsh -l -c '/usr/bin/claude -p hi'`.
fn wrap_in_shell(prefix: &str, binary: &Path, args: &[String]) -> Result<Command, SpawnError> {
    let prefix_parts = shlex::split(prefix)
        .filter(|parts| !parts.is_empty())
        .ok_or_else(|| SpawnError::InvalidCommand(format!("Bad shell prefix: {}", prefix)))?;

    let binary_str = binary.to_string_lossy();
    let mut command_parts = Vec::with_capacity(args.len() + 1);
    command_parts.push(
        shlex::try_quote(&binary_str)
            .map_err(|_| SpawnError::InvalidCommand(format!("Invalid path: {}", binary_str)))?
            .into_owned(),
    );
    for arg in args {
        command_parts.push(
            shlex::try_quote(arg)
                .map_err(|_| SpawnError::InvalidCommand(format!("Invalid argument: {}", arg)))?
                .into_owned(),
        );
    }

    let mut cmd = Command::new(&prefix_parts[0]);
    cmd.args(&prefix_parts[1..]).arg(command_parts.join(" "));
    Ok(cmd)
}

/// Prepend the binary's parent directory to PATH so node/etc. are found.
fn prepare_path_env(cmd: &mut Command, binary_path: &Path) {
    let Some(dir) = binary_path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    let mut paths = vec![dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    if let Ok(joined) = std::env::join_paths(paths) {
        cmd.env("PATH", joined);
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Signals the supervisor sends to a run's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Send `signal` to the process group led by `pid`.
///
/// Returns false when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> bool {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pgid <= 0 {
        return false;
    }
    // SAFETY: kill(2) with a negative pid targets the process group; no memory is shared.
    unsafe { libc::kill(-pgid, sig) == 0 }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn not_found_and_permission() {
            let path = Path::new("/nope/claude");
            let nf = SpawnError::from_io(io::Error::from(io::ErrorKind::NotFound), path);
            assert!(matches!(nf, SpawnError::NotFound(_)));
            let pd = SpawnError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), path);
            assert!(matches!(pd, SpawnError::PermissionDenied(_)));
            assert!(!pd.is_transient());
        }

        #[cfg(unix)]
        #[test]
        fn eagain_is_transient() {
            let err = SpawnError::from_io(io::Error::from_raw_os_error(libc::EAGAIN), Path::new("x"));
            assert!(err.is_transient());
        }
    }

    mod retry_policy {
        use super::*;

        #[test]
        fn delay_grows_and_is_bounded_by_jitter() {
            let policy = RetryPolicy {
                retries: 3,
                base_delay: Duration::from_millis(100),
            };
            for attempt in 1..=3u32 {
                let base = 100u64 * 2u64.pow(attempt - 1);
                let delay = policy.delay(attempt).as_millis() as u64;
                assert!(delay >= base && delay <= base + base / 2, "attempt {} delay {}", attempt, delay);
            }
        }
    }

    mod exit {
        use super::*;

        #[test]
        fn describes_code_and_signal() {
            let ok = RunExit { code: Some(0), signal: None };
            assert!(ok.success());
            assert_eq!(ok.describe(), "exit status 0");
            let killed = RunExit { code: None, signal: Some(9) };
            assert!(!killed.success());
            assert_eq!(killed.describe(), "killed by signal 9");
        }
    }

    #[cfg(unix)]
    mod spawning {
        use super::*;
        use tokio::io::AsyncReadExt;

        #[tokio::test]
        async fn runs_with_piped_stdout_and_cwd() {
            let dir = tempfile::tempdir().unwrap();
            let config = SpawnConfig::new("/bin/sh", vec!["-c".into(), "pwd".into()])
                .working_dir(dir.path());
            let mut child = spawn_with_retry(&config, RetryPolicy::default()).await.unwrap();
            let mut out = String::new();
            child.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
            let status = child.wait().await.unwrap();
            assert!(RunExit::from(status).success());
            let expected = dir.path().canonicalize().unwrap();
            assert_eq!(Path::new(out.trim()).canonicalize().unwrap(), expected);
        }

        #[tokio::test]
        async fn shell_prefix_quotes_arguments() {
            let config = SpawnConfig::new("/bin/echo", vec!["a b".into(), "it's".into()])
                .shell_prefix(Some("/bin/sh -c".to_string()));
            let mut child = spawn_with_retry(&config, RetryPolicy::default()).await.unwrap();
            let mut out = String::new();
            child.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
            child.wait().await.unwrap();
            assert_eq!(out.trim_end(), "a b it's");
        }

        #[tokio::test]
        async fn missing_binary_is_not_found() {
            let config = SpawnConfig::new("/definitely/not/here", vec![]);
            let err = spawn_with_retry(&config, RetryPolicy::default()).await.unwrap_err();
            assert!(matches!(err, SpawnError::NotFound(_)));
        }

        #[tokio::test]
        async fn signal_group_terminates_child() {
            let config = SpawnConfig::new("/bin/sh", vec!["-c".into(), "sleep 30".into()]);
            let mut child = spawn_with_retry(&config, RetryPolicy::default()).await.unwrap();
            let pid = child.id().unwrap();
            assert!(signal_group(pid, Signal::Terminate));
            let exit = RunExit::from(child.wait().await.unwrap());
            assert_eq!(exit.signal, Some(libc::SIGTERM));
        }
    }
}
