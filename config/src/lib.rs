//! Configuration for fleet.
//!
//! ```toml
//! [pool]
//! max_workers = 8
//! contexts_per_host = 1
//! task_timeout_secs = 300
//! startup_timeout_secs = 30
//! spawn_attempts = 3
//!
//! [executor]
//! command = "sh"
//! args = []
//!
//! [display]
//! dir = "."
//!
//! [host]
//! program = "fleet-host"
//! args = []
//! env = { RUST_LOG = "debug" }
//! ```
//!
//! The raw file structs here are all-optional. [`FleetConfig::pool_settings`]
//! and friends resolve them, together with environment overrides, into the
//! validated settings the rest of the workspace consumes.

mod display;
mod settings;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub use display::{DisplaySize, DisplayStore};
pub use settings::{EnvOverrides, ExecutorSettings, HostSettings, PoolSettings};

/// Environment variable that points at an alternate config file.
pub const CONFIG_PATH_VAR: &str = "FLEET_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct FleetConfig {
    pub pool: Option<PoolConfig>,
    pub executor: Option<ExecutorConfig>,
    pub display: Option<DisplayConfig>,
    pub host: Option<HostConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on concurrent host processes. Defaults to available
    /// parallelism.
    pub max_workers: Option<usize>,
    /// Execution contexts inside each host.
    pub contexts_per_host: Option<usize>,
    /// Per-task result deadline. `0` disables it.
    pub task_timeout_secs: Option<u64>,
    /// Deadline for a host or context to finish bring-up.
    pub startup_timeout_secs: Option<u64>,
    /// Host spawn attempts before giving up.
    pub spawn_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutorConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DisplayConfig {
    /// Directory that holds the display-size file.
    pub dir: Option<PathBuf>,
}

/// How the dispatcher launches host processes.
#[derive(Debug, Default, Deserialize)]
pub struct HostConfig {
    /// Host binary or a wrapper around it. Defaults to the installed
    /// `fleet-host`.
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra variables for every host; executors inherit them.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl FleetConfig {
    /// Load from [`config_path`]. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn pool_settings(&self, env: &EnvOverrides) -> PoolSettings {
        PoolSettings::resolve(self.pool.as_ref(), env)
    }

    #[must_use]
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings::resolve(self.executor.as_ref())
    }

    #[must_use]
    pub fn host_settings(&self) -> HostSettings {
        HostSettings::resolve(self.host.as_ref())
    }

    #[must_use]
    pub fn display_store(&self) -> DisplayStore {
        let dir = self
            .display
            .as_ref()
            .and_then(|d| d.dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        DisplayStore::new(dir)
    }
}

/// `$FLEET_CONFIG`, else `~/.fleet/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_VAR).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".fleet").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert!(config.pool.is_none());
        assert!(config.executor.is_none());
        assert!(config.display.is_none());
        assert!(config.host.is_none());
        assert_eq!(config.host_settings(), HostSettings::default());
    }

    #[test]
    fn parse_full_config() {
        let config: FleetConfig = toml::from_str(
            r#"
            [pool]
            max_workers = 6
            contexts_per_host = 2
            task_timeout_secs = 0
            startup_timeout_secs = 5
            spawn_attempts = 4

            [executor]
            command = "node"
            args = ["run.js"]

            [display]
            dir = "/tmp/fleet"

            [host]
            program = "/usr/bin/env"
            args = ["TZ=UTC", "fleet-host"]
            env = { RUST_LOG = "debug", FLEET_LOG_DIR = "/tmp/logs" }
            "#,
        )
        .unwrap();

        let pool = config.pool_settings(&EnvOverrides::default());
        assert_eq!(pool.max_workers, 6);
        assert_eq!(pool.contexts_per_host, 2);
        assert_eq!(pool.task_timeout, None);
        assert_eq!(pool.startup_timeout, Duration::from_secs(5));
        assert_eq!(pool.spawn_attempts, 4);

        let executor = config.executor_settings();
        assert_eq!(executor.command, "node");
        assert_eq!(executor.args, ["run.js"]);

        assert_eq!(
            config.display_store().path(),
            Path::new("/tmp/fleet").join(DisplayStore::FILE_NAME)
        );

        let host = config.host_settings();
        assert_eq!(host.program.as_deref(), Some(Path::new("/usr/bin/env")));
        assert_eq!(host.args, ["TZ=UTC", "fleet-host"]);
        assert_eq!(
            host.env,
            [
                ("FLEET_LOG_DIR".to_string(), "/tmp/logs".to_string()),
                ("RUST_LOG".to_string(), "debug".to_string()),
            ]
        );
    }

    #[test]
    fn unknown_field_types_are_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pool]\nmax_workers = \"many\"\n").unwrap();

        let err = FleetConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), path);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = FleetConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_reads_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[executor]\ncommand = \"bash\"\n").unwrap();

        let config = FleetConfig::load_from(&path).unwrap().unwrap();
        assert_eq!(config.executor_settings().command, "bash");
    }

    #[test]
    fn config_error_path_accessor() {
        let err = ConfigError::Read {
            path: PathBuf::from("/x/config.toml"),
            source: std::io::Error::other("denied"),
        };
        assert_eq!(err.path(), Path::new("/x/config.toml"));
        assert!(err.to_string().contains("/x/config.toml"));
    }
}
