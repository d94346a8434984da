use std::path::PathBuf;
use std::time::Duration;

use crate::{ExecutorConfig, HostConfig, PoolConfig};

const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SPAWN_ATTEMPTS: u32 = 3;
const DEFAULT_COMMAND: &str = "sh";

/// Values read from the process environment that take precedence over the
/// config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub interactive: bool,
    pub watch: bool,
    pub max_workers: Option<usize>,
}

impl EnvOverrides {
    pub const INTERACTIVE_VAR: &'static str = "FLEET_INTERACTIVE";
    pub const WATCH_VAR: &'static str = "FLEET_WATCH";
    pub const MAX_WORKERS_VAR: &'static str = "FLEET_MAX_WORKERS";

    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key).is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
        };
        let max_workers = lookup(Self::MAX_WORKERS_VAR).and_then(|v| match v.trim().parse() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                tracing::warn!(value = %v, "Ignoring invalid {}", Self::MAX_WORKERS_VAR);
                None
            }
        });
        Self {
            interactive: flag(Self::INTERACTIVE_VAR),
            watch: flag(Self::WATCH_VAR),
            max_workers,
        }
    }
}

/// Resolved pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub contexts_per_host: usize,
    /// `None` waits forever.
    pub task_timeout: Option<Duration>,
    pub startup_timeout: Duration,
    pub spawn_attempts: u32,
    pub watch: bool,
    pub interactive: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::resolve(None, &EnvOverrides::default())
    }
}

impl PoolSettings {
    pub(crate) fn resolve(raw: Option<&PoolConfig>, env: &EnvOverrides) -> Self {
        let max_workers = env
            .max_workers
            .or_else(|| raw.and_then(|p| p.max_workers))
            .unwrap_or_else(available_parallelism)
            .max(1);
        let contexts_per_host = raw
            .and_then(|p| p.contexts_per_host)
            .unwrap_or(1)
            .max(1);
        let task_timeout = match raw.and_then(|p| p.task_timeout_secs) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS)),
        };
        let startup_timeout = Duration::from_secs(
            raw.and_then(|p| p.startup_timeout_secs)
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
        );
        let spawn_attempts = raw
            .and_then(|p| p.spawn_attempts)
            .unwrap_or(DEFAULT_SPAWN_ATTEMPTS)
            .max(1);

        Self {
            max_workers,
            contexts_per_host,
            task_timeout,
            startup_timeout,
            spawn_attempts,
            watch: env.watch,
            interactive: env.interactive,
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Command line the default executor runs for each task. The task path is
/// appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::resolve(None)
    }
}

impl ExecutorSettings {
    pub(crate) fn resolve(raw: Option<&ExecutorConfig>) -> Self {
        let command = raw
            .and_then(|e| e.command.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_COMMAND)
            .to_string();
        Self {
            command,
            args: raw.map(|e| e.args.clone()).unwrap_or_default(),
        }
    }
}

/// Launch overrides for host processes. Variables are sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSettings {
    /// `None` means locate the installed host binary.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl HostSettings {
    pub(crate) fn resolve(raw: Option<&HostConfig>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        Self {
            program: raw.program.clone().filter(|p| !p.as_os_str().is_empty()),
            args: raw.args.clone(),
            env: raw
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn defaults_without_a_file() {
        let settings = PoolSettings::default();
        assert!(settings.max_workers >= 1);
        assert_eq!(settings.contexts_per_host, 1);
        assert_eq!(settings.task_timeout, Some(Duration::from_secs(300)));
        assert_eq!(settings.startup_timeout, Duration::from_secs(30));
        assert_eq!(settings.spawn_attempts, 3);
        assert!(!settings.watch);
        assert!(!settings.interactive);
    }

    #[test]
    fn env_max_workers_beats_the_file() {
        let raw = PoolConfig {
            max_workers: Some(2),
            ..PoolConfig::default()
        };
        let env = EnvOverrides::from_lookup(lookup(&[("FLEET_MAX_WORKERS", "7")]));
        assert_eq!(PoolSettings::resolve(Some(&raw), &env).max_workers, 7);
    }

    #[test]
    fn env_flags_are_read() {
        let env = EnvOverrides::from_lookup(lookup(&[
            ("FLEET_INTERACTIVE", "1"),
            ("FLEET_WATCH", "true"),
            ("FLEET_MAX_WORKERS", "0"),
        ]));
        assert!(env.interactive);
        assert!(env.watch);
        assert_eq!(env.max_workers, None);

        let settings = PoolSettings::resolve(None, &env);
        assert!(settings.interactive);
        assert!(settings.watch);
    }

    #[test]
    fn zero_values_are_clamped() {
        let raw = PoolConfig {
            max_workers: Some(0),
            contexts_per_host: Some(0),
            task_timeout_secs: Some(0),
            startup_timeout_secs: Some(0),
            spawn_attempts: Some(0),
        };
        let settings = PoolSettings::resolve(Some(&raw), &EnvOverrides::default());
        assert_eq!(settings.max_workers, 1);
        assert_eq!(settings.contexts_per_host, 1);
        assert_eq!(settings.task_timeout, None);
        assert_eq!(settings.startup_timeout, Duration::from_secs(30));
        assert_eq!(settings.spawn_attempts, 1);
    }

    #[test]
    fn blank_command_falls_back_to_sh() {
        let raw = ExecutorConfig {
            command: Some("  ".to_string()),
            args: vec!["-e".to_string()],
        };
        let settings = ExecutorSettings::resolve(Some(&raw));
        assert_eq!(settings.command, "sh");
        assert_eq!(settings.args, ["-e"]);
    }
}
