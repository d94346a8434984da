//! The seam between a context and whatever actually runs a task.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::process::Command;

use fleet_config::{DisplaySize, ExecutorSettings};
use fleet_types::{EntryId, PerfStats, TaskDescriptor, TaskResult};

pub type ExecFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ExecError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("executor unavailable: {command}: {reason}")]
    Unavailable { command: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

/// What a context tells its executor about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub id: EntryId,
    pub display: DisplaySize,
    pub interactive: bool,
}

/// Runs one task and produces its structured report.
///
/// `execute` returning `Err` (or panicking) means no report could be
/// produced; the context turns that into a failure-shaped result. A task
/// that ran and failed is `Ok` with a failure message.
pub trait TaskExecutor: Send + Sync {
    /// One-time bring-up for a new context. The context is not handed out
    /// until this succeeds.
    fn prepare<'a>(&'a self, _surface: &'a SurfaceInfo) -> ExecFut<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn execute<'a>(
        &'a self,
        task: &'a TaskDescriptor,
        surface: &'a SurfaceInfo,
    ) -> ExecFut<'a, TaskResult>;
}

/// Runs `command args... <task path>` per task.
///
/// If stdout is a JSON report it is used verbatim, except that a non-zero
/// exit always fails; otherwise the exit status decides, with stderr as the
/// failure message.
#[derive(Debug)]
pub struct CommandExecutor {
    settings: ExecutorSettings,
    resolved: OnceLock<PathBuf>,
}

impl CommandExecutor {
    /// Task config, as JSON.
    pub const TASK_CONFIG_VAR: &'static str = "FLEET_TASK_CONFIG";
    /// Run-wide config, as JSON.
    pub const GLOBAL_CONFIG_VAR: &'static str = "FLEET_GLOBAL_CONFIG";
    /// `WIDTHxHEIGHT` of the context's display.
    pub const DISPLAY_VAR: &'static str = "FLEET_DISPLAY";
    pub const CONTEXT_VAR: &'static str = "FLEET_CONTEXT_ID";

    #[must_use]
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            resolved: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }
}

impl TaskExecutor for CommandExecutor {
    fn prepare<'a>(&'a self, _surface: &'a SurfaceInfo) -> ExecFut<'a, ()> {
        Box::pin(async move {
            if self.resolved.get().is_none() {
                let path = which::which(&self.settings.command).map_err(|e| {
                    ExecError::Unavailable {
                        command: self.settings.command.clone(),
                        reason: e.to_string(),
                    }
                })?;
                tracing::debug!(command = %path.display(), "Resolved task command");
                let _ = self.resolved.set(path);
            }
            Ok(())
        })
    }

    fn execute<'a>(
        &'a self,
        task: &'a TaskDescriptor,
        surface: &'a SurfaceInfo,
    ) -> ExecFut<'a, TaskResult> {
        Box::pin(async move {
            let program = self
                .resolved
                .get()
                .cloned()
                .unwrap_or_else(|| PathBuf::from(&self.settings.command));
            let config = serde_json::to_string(&task.config)
                .map_err(|e| ExecError::Failed(format!("failed to encode task config: {e}")))?;
            let global_config = serde_json::to_string(&task.global_config)
                .map_err(|e| ExecError::Failed(format!("failed to encode global config: {e}")))?;

            let start = epoch_ms();
            let output = Command::new(&program)
                .args(&self.settings.args)
                .arg(&task.path)
                .env(Self::TASK_CONFIG_VAR, config)
                .env(Self::GLOBAL_CONFIG_VAR, global_config)
                .env(
                    Self::DISPLAY_VAR,
                    format!("{}x{}", surface.display.width, surface.display.height),
                )
                .env(Self::CONTEXT_VAR, surface.id.value().to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| ExecError::Failed(format!("failed to run {}: {e}", program.display())))?;
            let perf = PerfStats::new(start, epoch_ms());

            Ok(interpret(&task.path, &output, perf))
        })
    }
}

fn interpret(path: &str, output: &Output, perf: PerfStats) -> TaskResult {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_message = || match stderr.trim_end() {
        "" => format!("exited with {}", output.status),
        text => text.to_string(),
    };

    if let Ok(mut report) = serde_json::from_str::<TaskResult>(stdout.trim()) {
        if report.test_file_path.is_empty() {
            report.test_file_path = path.to_string();
        }
        // A report cannot claim success for a process that failed.
        if !output.status.success() && report.failure_message.is_none() {
            report.failure_message = Some(exit_message());
            report.num_failing_tests = report.num_failing_tests.max(1);
        }
        return report;
    }

    let mut result = if output.status.success() {
        TaskResult::passed(path, perf)
    } else {
        TaskResult::failed(path, exit_message(), perf)
    };
    if !stdout.trim().is_empty() {
        result.console = json!([{ "message": stdout, "origin": path, "type": "log" }]);
    }
    result
}

pub(crate) fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
