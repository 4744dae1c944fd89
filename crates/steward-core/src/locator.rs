//! Provider binary resolution.
//!
//! Search order for a provider:
//!
//! 1. `STEWARD_<PROVIDER>_BIN`, then the config file's `binaries` entry
//! 2. `PATH`
//! 3. configured `searchDirs`, then conventional install directories
//!    (`~/.local/bin`, `~/.npm-global/bin`, `/usr/local/bin`, ...)
//!
//! An override that does not point at an executable is an error rather than
//! being skipped: the user asked for that binary specifically.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::SupervisorConfig;
use crate::paths;
use crate::provider::Provider;

#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("{provider} executable not found. Searched:\n{}", .searched.join("\n"))]
    NotFound {
        provider: Provider,
        searched: Vec<String>,
    },

    #[error("{origin} points to {}, which is not an executable file", .path.display())]
    OverrideInvalid {
        provider: Provider,
        origin: String,
        path: PathBuf,
    },
}

/// Resolves provider executables.
#[derive(Debug, Clone)]
pub struct Locator {
    overrides: HashMap<Provider, PathBuf>,
    search_dirs: Vec<PathBuf>,
    use_env_overrides: bool,
    conventional: bool,
    /// PATH value to search; `None` reads the process environment.
    path_var: Option<OsString>,
}

impl Default for Locator {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            search_dirs: Vec::new(),
            use_env_overrides: true,
            conventional: true,
            path_var: None,
        }
    }
}

impl Locator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            overrides: config.binaries.clone(),
            search_dirs: config.search_dirs.clone(),
            ..Self::default()
        }
    }

    pub fn with_override(mut self, provider: Provider, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(provider, path.into());
        self
    }

    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    /// Search this PATH value instead of the process's.
    pub fn with_path_var(mut self, path_var: impl Into<OsString>) -> Self {
        self.path_var = Some(path_var.into());
        self
    }

    /// Only consult explicit overrides, PATH and configured search dirs.
    pub fn isolated(mut self) -> Self {
        self.use_env_overrides = false;
        self.conventional = false;
        self
    }

    /// Resolve `provider` to an absolute executable path.
    pub fn locate(&self, provider: Provider) -> Result<PathBuf, LocatorError> {
        let mut searched = Vec::new();

        if self.use_env_overrides {
            let var = provider.override_env_var();
            if let Some(value) = std::env::var_os(&var).filter(|v| !v.is_empty()) {
                return check_override(provider, format!("${}", var), PathBuf::from(value));
            }
            searched.push(format!("${} (unset)", var));
        }

        if let Some(path) = self.overrides.get(&provider) {
            return check_override(provider, format!("binaries.{}", provider), path.clone());
        }

        let name = provider.binary_name();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let path_var = self.path_var.clone().or_else(|| std::env::var_os("PATH"));
        if let Some(path_var) = &path_var {
            if let Ok(found) = which::which_in(name, Some(path_var), &cwd) {
                log::debug!("Located {} on PATH at {}", provider, found.display());
                return Ok(absolute(found));
            }
        }
        searched.push("PATH".to_string());

        let mut dirs = self.search_dirs.clone();
        if self.conventional {
            dirs.extend(paths::conventional_bin_dirs());
        }
        for dir in dirs {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                log::debug!("Located {} at {}", provider, candidate.display());
                return Ok(absolute(candidate));
            }
            searched.push(candidate.display().to_string());
        }

        Err(LocatorError::NotFound { provider, searched })
    }
}

fn check_override(provider: Provider, origin: String, path: PathBuf) -> Result<PathBuf, LocatorError> {
    if is_executable(&path) {
        log::debug!("Using {} override {} = {}", provider, origin, path.display());
        Ok(absolute(path))
    } else {
        Err(LocatorError::OverrideInvalid {
            provider,
            origin,
            path,
        })
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// [`Locator`] that remembers successful lookups.
///
/// A cached path that stops being executable (uninstalled, upgraded in
/// place to a new location) is looked up again.
#[derive(Debug)]
pub struct CachedLocator {
    inner: Locator,
    cache: Mutex<HashMap<Provider, PathBuf>>,
}

impl CachedLocator {
    pub fn new(inner: Locator) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn locate(&self, provider: Provider) -> Result<PathBuf, LocatorError> {
        if let Some(path) = self.cached(provider) {
            if is_executable(&path) {
                return Ok(path);
            }
        }
        let path = self.inner.locate(provider)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(provider, path.clone());
        }
        Ok(path)
    }

    fn cached(&self, provider: Provider) -> Option<PathBuf> {
        self.cache.lock().ok()?.get(&provider).cloned()
    }

    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_binary(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn explicit_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let bin = make_binary(dir.path(), "my-claude", 0o755);
        let on_path = tempfile::tempdir().unwrap();
        make_binary(on_path.path(), "claude", 0o755);

        let locator = Locator::new()
            .isolated()
            .with_path_var(on_path.path())
            .with_override(Provider::Claude, &bin);
        assert_eq!(locator.locate(Provider::Claude).unwrap(), bin);
    }

    #[test]
    fn non_executable_override_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = make_binary(dir.path(), "claude", 0o644);
        let locator = Locator::new().isolated().with_override(Provider::Claude, &bin);
        let err = locator.locate(Provider::Claude).unwrap_err();
        assert!(matches!(err, LocatorError::OverrideInvalid { .. }));
        assert!(err.to_string().contains("binaries.claude"));
    }

    #[test]
    fn finds_binary_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = make_binary(dir.path(), "gemini", 0o755);
        let locator = Locator::new().isolated().with_path_var(dir.path());
        assert_eq!(locator.locate(Provider::Gemini).unwrap(), bin);
    }

    #[test]
    fn falls_back_to_search_dirs() {
        let empty = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        let bin = make_binary(extra.path(), "codex", 0o755);
        let locator = Locator::new()
            .isolated()
            .with_path_var(empty.path())
            .with_search_dirs(vec![extra.path().to_path_buf()]);
        assert_eq!(locator.locate(Provider::Codex).unwrap(), bin);
    }

    #[test]
    fn not_found_lists_every_location() {
        let empty = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        let locator = Locator::new()
            .isolated()
            .with_path_var(empty.path())
            .with_search_dirs(vec![extra.path().to_path_buf()]);
        match locator.locate(Provider::Codex).unwrap_err() {
            LocatorError::NotFound { provider, searched } => {
                assert_eq!(provider, Provider::Codex);
                assert_eq!(searched[0], "PATH");
                assert_eq!(searched[1], extra.path().join("codex").display().to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn env_override_is_consulted_first() {
        let dir = tempfile::tempdir().unwrap();
        let bin = make_binary(dir.path(), "gem", 0o755);
        let value = bin.to_string_lossy().to_string();
        crate::paths::test_env::with_vars(&[("STEWARD_GEMINI_BIN", Some(value.as_str()))], || {
            let locator = Locator::new().with_override(Provider::Gemini, "/nonexistent");
            assert_eq!(locator.locate(Provider::Gemini).unwrap(), bin);
        });
    }

    #[test]
    fn cache_recovers_when_binary_disappears() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let old = make_binary(first.path(), "claude", 0o755);
        let path_var = std::env::join_paths([first.path(), second.path()]).unwrap();
        let cached = CachedLocator::new(Locator::new().isolated().with_path_var(path_var));

        assert_eq!(cached.locate(Provider::Claude).unwrap(), old);
        std::fs::remove_file(&old).unwrap();
        let new = make_binary(second.path(), "claude", 0o755);
        assert_eq!(cached.locate(Provider::Claude).unwrap(), new);
    }
}
