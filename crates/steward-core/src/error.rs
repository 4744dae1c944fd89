//! Crate-level error for hosts that do not care which stage failed.

use crate::config::ConfigError;
use crate::locator::LocatorError;
use crate::process::SpawnError;
use crate::session::SessionError;
use crate::supervisor::SupervisorError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl Error {
    /// True when retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Spawn(e) | Error::Supervisor(SupervisorError::Spawn(e)) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use std::path::PathBuf;

    #[test]
    fn messages_pass_through() {
        let err: Error = SupervisorError::Locate(LocatorError::NotFound {
            provider: Provider::Codex,
            searched: vec!["PATH".to_string()],
        })
        .into();
        assert!(err.to_string().starts_with("codex executable not found"));
    }

    #[test]
    fn transient_spawn_failures() {
        let exhausted = SpawnError::ResourceExhausted {
            path: PathBuf::from("/bin/claude"),
            source: std::io::Error::from(std::io::ErrorKind::WouldBlock),
        };
        assert!(Error::from(SupervisorError::Spawn(exhausted)).is_transient());
        assert!(!Error::from(SpawnError::NotFound(PathBuf::from("/x"))).is_transient());
    }
}
