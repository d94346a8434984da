//! The task envelope: what gets dispatched and what comes back.
//!
//! The structured report inside [`TaskResult`] is produced by an opaque
//! executor. The pool only reads `failure_message` (to route the result) and
//! `test_file_path` (for logging); everything else is carried through
//! untouched, including fields this crate does not model (`extra`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Serializable description of one unit of work.
///
/// Immutable once dispatched; passed by value across both boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    /// Path of the test file to run.
    pub path: String,
    /// Per-project execution configuration.
    #[serde(default)]
    pub config: Value,
    /// Run-wide configuration shared by every task.
    #[serde(default)]
    pub global_config: Value,
}

impl TaskDescriptor {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            config: Value::Null,
            global_config: Value::Null,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_global_config(mut self, global_config: Value) -> Self {
        self.global_config = global_config;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfStats {
    /// Unix epoch milliseconds.
    pub start: i64,
    /// Unix epoch milliseconds.
    pub end: i64,
    /// `runtime`, `slow` and whatever else the executor timed.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PerfStats {
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            extra: Map::new(),
        }
    }

    /// Wall time in milliseconds, preferring the executor's own `runtime`.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.extra
            .get("runtime")
            .and_then(Value::as_i64)
            .unwrap_or(self.end - self.start)
            .max(0)
    }
}

/// Structured report for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub test_file_path: String,
    /// Set when the task failed. A non-null value routes the result to the
    /// failure callback.
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub num_failing_tests: u32,
    #[serde(default)]
    pub num_passing_tests: u32,
    #[serde(default)]
    pub num_pending_tests: u32,
    #[serde(default)]
    pub num_todo_tests: u32,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub perf_stats: PerfStats,
    /// Captured console output: `null`, or a list of `{message, origin,
    /// type}` entries.
    #[serde(default)]
    pub console: Value,
    /// Error raised by the executor before it could produce a report, as the
    /// executor serialized it.
    #[serde(default)]
    pub test_exec_error: Option<Value>,
    /// Report fields the pool does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskResult {
    /// A passing report with a single passing test.
    #[must_use]
    pub fn passed(path: impl Into<String>, perf_stats: PerfStats) -> Self {
        Self {
            test_file_path: path.into(),
            failure_message: None,
            num_failing_tests: 0,
            num_passing_tests: 1,
            num_pending_tests: 0,
            num_todo_tests: 0,
            skipped: false,
            perf_stats,
            console: Value::Null,
            test_exec_error: None,
            extra: Map::new(),
        }
    }

    /// A report for a task that ran to completion and failed.
    #[must_use]
    pub fn failed(path: impl Into<String>, message: impl Into<String>, perf_stats: PerfStats) -> Self {
        Self {
            failure_message: Some(message.into()),
            num_failing_tests: 1,
            num_passing_tests: 0,
            ..Self::passed(path, perf_stats)
        }
    }

    /// Failure-shaped report for an executor that errored before producing a
    /// structured result.
    ///
    /// `config` is consulted for `rootDir` so the message can show the path
    /// relative to the project root.
    #[must_use]
    pub fn fatal(path: &str, error: &str, config: &Value) -> Self {
        let shown = config
            .get("rootDir")
            .and_then(Value::as_str)
            .and_then(|root| path.strip_prefix(root))
            .map(|rest| rest.trim_start_matches(['/', '\\']))
            .unwrap_or(path);
        let failure_message = format!("  ● Test suite failed to run\n\n    {shown}\n\n    {error}");

        Self {
            test_file_path: path.to_string(),
            failure_message: Some(failure_message),
            num_failing_tests: 1,
            num_passing_tests: 0,
            num_pending_tests: 0,
            num_todo_tests: 0,
            skipped: false,
            perf_stats: PerfStats::default(),
            console: Value::Null,
            test_exec_error: Some(serde_json::json!({ "message": error })),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failure_message.is_some()
    }

    /// Console messages joined by newlines. Bare strings are accepted too.
    #[must_use]
    pub fn console_text(&self) -> String {
        match &self.console {
            Value::String(text) => text.clone(),
            Value::Array(entries) => entries
                .iter()
                .filter_map(|entry| entry.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }

    /// `message` of the execution error, or the error itself when it is a
    /// bare string.
    #[must_use]
    pub fn exec_error_message(&self) -> Option<&str> {
        match self.test_exec_error.as_ref()? {
            Value::String(message) => Some(message),
            error => error.get("message").and_then(Value::as_str),
        }
    }
}
