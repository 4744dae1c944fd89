//! Per-run transcript files.
//!
//! When a log directory is configured every run gets
//! `{log_dir}/{run_id}.log`, with one timestamped line per raw stdout
//! frame, stderr line and emitted event.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

use crate::registry::RunId;

/// Thread-safe handle to an append-only transcript; `None` when disabled.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Which side of the run a transcript line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
    Event,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Stdout => "STDOUT",
            Channel::Stderr => "STDERR",
            Channel::Event => "EVENT",
        })
    }
}

/// Current UTC time as RFC 3339 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Write a timestamped line to the transcript (if present).
pub fn log_line(handle: &LogHandle, channel: Channel, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let _ = writeln!(file, "[{}] {}: {}", utc_timestamp(), channel, data.trim_end());
            let _ = file.flush();
        }
    }
}

/// Open (or create) `{log_dir}/{run_id}.log` and return a shared handle.
///
/// Failures are logged and yield a disabled handle; a transcript is never
/// a reason to fail a run.
pub fn open_log_file(log_dir: Option<&Path>, run_id: RunId) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        let path = dir.join(format!("{}.log", run_id));
        let opened = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("Cannot open transcript {}: {}", path.display(), e);
                None
            }
        }
    });
    Arc::new(Mutex::new(file))
}
