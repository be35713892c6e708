//! Server configuration, read once at startup.

use crate::error::StartupError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default idle time after which a client session is reaped (10 minutes).
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 600;
/// Default time the server waits with no clients before exiting (10 minutes).
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 600;
/// Default autosave interval (10 minutes).
pub const DEFAULT_AUTOSAVE_SECS: u64 = 600;

/// How read access is granted. Write access is always secret-gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Policy {
    /// Only a write secret exists; every request must present it.
    Restricted,
    /// Separate read and write secrets, each published in its own directory.
    DirectorySecret,
    /// Anyone with a session may read; write needs the write secret.
    Public,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Restricted => "restricted",
            Policy::DirectorySecret => "directory-secret",
            Policy::Public => "public",
        }
    }

    /// Whether a read secret is derived and published as a file.
    pub fn publishes_read_secret(&self) -> bool {
        matches!(self, Policy::DirectorySecret)
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub policy: Policy,
    /// `WriteAccessDirectory`. When absent no session can ever obtain write access.
    pub write_dir: Option<PathBuf>,
    /// `ReadAccessDirectory`. Only used under [`Policy::DirectorySecret`].
    pub read_dir: Option<PathBuf>,
    /// Zero disables idle expiry of clients.
    pub client_timeout: Duration,
    /// Zero disables the no-client shutdown countdown.
    pub server_timeout: Duration,
    /// Server-side response ceiling in bytes. Zero means unlimited.
    pub max_response_bytes: usize,
    /// Zero disables autosave.
    pub autosave_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Public,
            write_dir: None,
            read_dir: None,
            client_timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS),
            server_timeout: Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECS),
            max_response_bytes: 0,
            autosave_interval: Duration::from_secs(DEFAULT_AUTOSAVE_SECS),
        }
    }
}

impl ServerConfig {
    /// Whether the write tier is attainable at all in this deployment.
    pub fn write_enabled(&self) -> bool {
        self.write_dir.is_some()
    }

    /// Check the policy against the configured directories and make sure every
    /// directory that will receive secret files exists and is writable.
    pub fn validate(&self) -> Result<(), StartupError> {
        match self.policy {
            Policy::Restricted if self.write_dir.is_none() => {
                return Err(StartupError::MissingDirectory {
                    policy: self.policy.as_str(),
                    which: "a write access directory",
                });
            }
            Policy::DirectorySecret if self.read_dir.is_none() => {
                return Err(StartupError::MissingDirectory {
                    policy: self.policy.as_str(),
                    which: "a read access directory",
                });
            }
            _ => {}
        }

        if let Some(dir) = &self.write_dir {
            check_directory(dir)?;
        }
        if self.policy.publishes_read_secret() {
            if let Some(dir) = &self.read_dir {
                check_directory(dir)?;
            }
        }
        Ok(())
    }
}

fn check_directory(dir: &Path) -> Result<(), StartupError> {
    let unusable = |reason: String| StartupError::UnusableDirectory {
        path: dir.to_path_buf(),
        reason,
    };

    let meta = std::fs::metadata(dir).map_err(|e| unusable(e.to_string()))?;
    if !meta.is_dir() {
        return Err(unusable("not a directory".to_string()));
    }

    #[cfg(unix)]
    {
        use nix::unistd::{access, AccessFlags};
        access(dir, AccessFlags::W_OK | AccessFlags::X_OK)
            .map_err(|e| unusable(format!("not writable: {}", e)))?;
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() {
            return Err(unusable("read-only".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn restricted_needs_write_dir() {
        let config = ServerConfig {
            policy: Policy::Restricted,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StartupError::MissingDirectory { .. })
        ));
    }

    #[test]
    fn directory_secret_needs_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            policy: Policy::DirectorySecret,
            write_dir: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StartupError::MissingDirectory { .. })
        ));
    }

    #[test]
    fn missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            policy: Policy::Restricted,
            write_dir: Some(dir.path().join("does-not-exist")),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StartupError::UnusableDirectory { .. })
        ));
    }

    #[test]
    fn file_instead_of_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        let config = ServerConfig {
            policy: Policy::Public,
            write_dir: Some(file),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StartupError::UnusableDirectory { .. })
        ));
    }

    #[test]
    fn read_dir_ignored_outside_directory_secret() {
        let config = ServerConfig {
            policy: Policy::Public,
            read_dir: Some(PathBuf::from("/definitely/not/here")),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
