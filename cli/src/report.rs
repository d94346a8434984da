use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use fleet_engine::{RunObserver, RunSummary, TaskFailure};
use fleet_types::{TaskDescriptor, TaskResult};

/// Prints one line per settled task, plus the failure detail.
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ConsoleReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleReporter").finish_non_exhaustive()
    }
}

impl ConsoleReporter {
    #[must_use]
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn summary(&self, summary: &RunSummary) {
        let mut line = format!("\n{summary}");
        if summary.aborted {
            line.push_str(" (aborted: no host could be started)");
        }
        self.write(&line);
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{text}").and_then(|()| out.flush()) {
            tracing::warn!("Failed to write report: {e}");
        }
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl RunObserver for ConsoleReporter {
    fn on_start(&self, task: &TaskDescriptor) {
        tracing::debug!(path = %task.path, "Task started");
    }

    fn on_result(&self, task: &TaskDescriptor, result: &TaskResult) {
        self.write(&format!("PASS {} ({} ms)", task.path, result.perf_stats.duration_ms()));
    }

    fn on_failure(&self, task: &TaskDescriptor, failure: &TaskFailure) {
        let mut text = format!("FAIL {}", task.path);
        if let Some(result) = failure.result() {
            text.push_str(&format!(" ({} ms)", result.perf_stats.duration_ms()));
        }
        text.push('\n');
        text.push_str(&indent(&failure.message()));
        self.write(&text);
    }
}
