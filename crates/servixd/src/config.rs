//! Daemon configuration.
//!
//! Resolution order: explicit `--config` path, then
//! `<config_dir>/servix/servix.toml`, then built-in defaults. Environment
//! variables `SERVIX_SOCKET` and `SERVIX_GRACE_PERIOD_SECS` override the
//! loaded values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::sync::StalePolicy;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/servix.sock";

/// Environment variable overriding `socket_path`
pub const SOCKET_ENV: &str = "SERVIX_SOCKET";

/// Environment variable overriding `grace_period_secs`
pub const GRACE_PERIOD_ENV: &str = "SERVIX_GRACE_PERIOD_SECS";

/// Maximum message size (1 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Settings for `servixd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,

    /// How long a dropped connection keeps its session (24 h).
    pub grace_period_secs: u64,

    pub max_message_size: usize,

    /// Idle connections are closed after this long (5 minutes).
    pub read_timeout_secs: u64,

    pub write_timeout_secs: u64,

    /// Channels every new connection joins.
    pub default_channels: Vec<String>,

    pub stale_policy: StalePolicy,

    /// `EnvFilter` directives; `RUST_LOG` still wins.
    pub log_filter: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            grace_period_secs: 24 * 60 * 60,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_timeout_secs: 300,
            write_timeout_secs: 10,
            default_channels: vec!["everyone".to_string()],
            stale_policy: StalePolicy::default(),
            log_filter: None,
        }
    }
}

impl ServerConfig {
    /// Loads the configuration and applies environment overrides.
    ///
    /// A missing file at the default location is not an error; a missing
    /// file named explicitly is.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config = Self::from_toml(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Applies overrides read through `lookup` (the process environment in
    /// [`ServerConfig::load`]).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(SOCKET_ENV) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(value) = lookup(GRACE_PERIOD_ENV) {
            self.grace_period_secs =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: GRACE_PERIOD_ENV,
                    value,
                })?;
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// `<config_dir>/servix/servix.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("servix").join("servix.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.grace_period(), Duration::from_secs(86_400));
        assert_eq!(config.max_message_size, 1_048_576);
        assert_eq!(config.default_channels, vec!["everyone"]);
        assert_eq!(config.stale_policy, StalePolicy::Recreate);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            grace_period_secs = 30
            stale_policy = "discard"
            default_channels = []
            "#,
        )
        .unwrap();
        assert_eq!(config.grace_period_secs, 30);
        assert_eq!(config.stale_policy, StalePolicy::Discard);
        assert!(config.default_channels.is_empty());
        assert_eq!(config.read_timeout_secs, 300);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "socket_path = \"/run/servix-test.sock\"").unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/servix-test.sock"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grace_period_secs = \"soon\"").unwrap();
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (SOCKET_ENV, "/tmp/other.sock"),
            (GRACE_PERIOD_ENV, "5"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config
            .apply_overrides(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.grace_period_secs, 5);

        let err = config
            .apply_overrides(|var| (var == GRACE_PERIOD_ENV).then(|| "x".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
