//! Shared test utilities and fixtures

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use fleet_engine::{RunObserver, TaskFailure};
use fleet_host::{HostLauncher, HostPoolConfig, ProcessLauncher};
use fleet_types::{TaskDescriptor, TaskResult};
use fleet_utils::BackoffPolicy;

pub const HOST_BIN: &str = env!("CARGO_BIN_EXE_fleet-host");
pub const FLEET_BIN: &str = env!("CARGO_BIN_EXE_fleet");

/// Dispatches on the file name: `crash*` kills the host running it,
/// `fail*` exits non-zero, `greet*` fails with `$FLEET_GREETING` as its
/// message, `slow*` takes a while, anything else passes.
const TASK_SCRIPT: &str = r#"#!/bin/sh
name=$(basename "$1")
case "$name" in
  crash*) kill -9 "$PPID"; exit 1 ;;
  fail*) echo "assertion failed in $name" >&2; exit 1 ;;
  greet*) echo "greeting=$FLEET_GREETING" >&2; exit 1 ;;
  slow*) sleep 1 ;;
esac
echo "ran $name"
"#;

/// A temp directory holding a task script and a config that points the
/// executor at it.
pub struct Fixture {
    pub dir: TempDir,
    pub config: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("task.sh");
        std::fs::write(&script, TASK_SCRIPT).unwrap();

        let config = dir.path().join("config.toml");
        let toml = format!(
            r#"[pool]
task_timeout_secs = 30
startup_timeout_secs = 30
spawn_attempts = 1

[executor]
command = "sh"
args = [{script:?}]

[display]
dir = {dir:?}
"#,
            script = script.display().to_string(),
            dir = dir.path().display().to_string(),
        );
        std::fs::write(&config, toml).unwrap();

        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Add sections to the generated config.
    pub fn extend_config(&self, toml: &str) {
        let mut content = std::fs::read_to_string(&self.config).unwrap();
        content.push('\n');
        content.push_str(toml);
        std::fs::write(&self.config, content).unwrap();
    }

    pub fn launcher(&self) -> Arc<dyn HostLauncher> {
        Arc::new(
            ProcessLauncher::new(HOST_BIN)
                .env("FLEET_CONFIG", self.config.display().to_string())
                .env("RUST_LOG", "warn"),
        )
    }

    pub fn task(&self, name: &str) -> TaskDescriptor {
        TaskDescriptor::new(self.path().join(name).display().to_string())
    }
}

pub fn pool_config(max_size: usize) -> HostPoolConfig {
    HostPoolConfig {
        max_size,
        task_timeout: Some(Duration::from_secs(30)),
        startup_timeout: Duration::from_secs(30),
        spawn_backoff: BackoffPolicy::no_retry(),
        ..HostPoolConfig::default()
    }
}

/// Observer that keeps every callback in order.
#[derive(Default)]
pub struct Recorder {
    pub started: Mutex<Vec<String>>,
    pub passed: Mutex<Vec<String>>,
    pub failed: Mutex<Vec<(String, TaskFailure)>>,
}

impl RunObserver for Recorder {
    fn on_start(&self, task: &TaskDescriptor) {
        self.started.lock().unwrap().push(task.path.clone());
    }

    fn on_result(&self, task: &TaskDescriptor, _result: &TaskResult) {
        self.passed.lock().unwrap().push(task.path.clone());
    }

    fn on_failure(&self, task: &TaskDescriptor, failure: &TaskFailure) {
        self.failed
            .lock()
            .unwrap()
            .push((task.path.clone(), failure.clone()));
    }
}
