//! Supervisor configuration.
//!
//! Configuration is a camelCase JSON file; every field is optional and falls
//! back to [`SupervisorConfig::default`]:
//!
//! ```json
//! {
//!   "graceMs": 3000,
//!   "sessionWindowMs": 1500,
//!   "binaries": { "claude": "/opt/claude/bin/claude" },
//!   "searchDirs": ["/opt/tools/bin"],
//!   "logDir": "/tmp/steward-logs"
//! }
//! ```
//!
//! [`SupervisorConfig::load_default`] looks for the file at `$STEWARD_CONFIG`,
//! then `./steward.json`, then the user config directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::process::RetryPolicy;
use crate::provider::Provider;
use crate::reader::{DEFAULT_FRAME_CEILING, DEFAULT_READ_BUFFER_SIZE};
use crate::session::DEFAULT_SESSION_WINDOW;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "STEWARD_CONFIG";

const LOCAL_CONFIG_FILE: &str = "steward.json";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// Size of each reader's fixed read buffer, in bytes.
    pub read_buffer_size: usize,
    /// Largest accepted frame, in bytes.
    pub frame_ceiling: usize,
    /// Events buffered between a run and its consumer.
    pub channel_capacity: usize,
    /// How long a terminated run may take to exit before it is killed.
    pub grace_ms: u64,
    /// How long to wait for the provider's session id before falling back.
    pub session_window_ms: u64,
    /// Runs older than this are terminated by the orphan sweep. `null` disables.
    pub max_run_age_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    pub spawn_retries: u32,
    pub spawn_backoff_ms: u64,
    /// Stderr lines kept per run for failure reports.
    pub stderr_tail_lines: usize,
    /// Explicit binary paths per provider.
    pub binaries: HashMap<Provider, PathBuf>,
    /// Extra directories searched before the conventional install locations.
    pub search_dirs: Vec<PathBuf>,
    /// Wrap provider commands in a shell, e.g. "/bin/zsh -l -c".
    pub shell_prefix: Option<String>,
    /// Per-run transcript directory; disabled when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            frame_ceiling: DEFAULT_FRAME_CEILING,
            channel_capacity: 256,
            grace_ms: 5_000,
            session_window_ms: DEFAULT_SESSION_WINDOW.as_millis() as u64,
            max_run_age_secs: Some(4 * 60 * 60),
            sweep_interval_secs: 30,
            spawn_retries: 3,
            spawn_backoff_ms: 50,
            stderr_tail_lines: 64,
            binaries: HashMap::new(),
            search_dirs: Vec::new(),
            shell_prefix: None,
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load from the first existing standard location, or use defaults.
    ///
    /// A path given in `$STEWARD_CONFIG` must exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
            return Self::load(Path::new(&explicit));
        }
        let candidates = [Some(PathBuf::from(LOCAL_CONFIG_FILE)), paths::user_config_file()];
        for path in candidates.into_iter().flatten() {
            if path.is_file() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("readBufferSize", self.read_buffer_size),
            ("frameCeiling", self.frame_ceiling),
            ("channelCapacity", self.channel_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweepIntervalSecs must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn session_window(&self) -> Duration {
        Duration::from_millis(self.session_window_ms)
    }

    pub fn max_run_age(&self) -> Option<Duration> {
        self.max_run_age_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.spawn_retries,
            base_delay: Duration::from_millis(self.spawn_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::test_env::with_vars;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = write_config(r#"{"graceMs": 250, "binaries": {"codex": "/opt/codex"}}"#);
        let config = SupervisorConfig::load(file.path()).unwrap();
        assert_eq!(config.grace(), Duration::from_millis(250));
        assert_eq!(config.binaries.get(&Provider::Codex), Some(&PathBuf::from("/opt/codex")));
        assert_eq!(config.frame_ceiling, DEFAULT_FRAME_CEILING);
        assert_eq!(config.session_window(), DEFAULT_SESSION_WINDOW);
    }

    #[test]
    fn null_max_age_disables_expiry() {
        let file = write_config(r#"{"maxRunAgeSecs": null}"#);
        assert_eq!(SupervisorConfig::load(file.path()).unwrap().max_run_age(), None);
    }

    #[test]
    fn parse_error_names_path() {
        let file = write_config("{not json");
        let err = SupervisorConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn unknown_provider_key_is_rejected() {
        let file = write_config(r#"{"binaries": {"copilot": "/x"}}"#);
        assert!(matches!(
            SupervisorConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn zero_sizes_are_invalid() {
        let file = write_config(r#"{"frameCeiling": 0}"#);
        assert!(matches!(
            SupervisorConfig::load(file.path()),
            Err(ConfigError::Invalid(msg)) if msg.contains("frameCeiling")
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = SupervisorConfig::load(Path::new("/nonexistent/steward.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn env_var_selects_file() {
        let file = write_config(r#"{"channelCapacity": 8}"#);
        let path = file.path().to_string_lossy().to_string();
        with_vars(&[(CONFIG_ENV_VAR, Some(path.as_str()))], || {
            assert_eq!(SupervisorConfig::load_default().unwrap().channel_capacity, 8);
        });
    }

    #[test]
    fn round_trips_through_json() {
        let config = SupervisorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"sessionWindowMs\":3000"));
        let back: SupervisorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
