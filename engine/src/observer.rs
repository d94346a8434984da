use std::fmt;

use fleet_types::{DispatchError, TaskDescriptor, TaskResult};

/// Why a task ended up on the failure callback.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailure {
    /// The task ran and its report carries a failure message.
    Reported { message: String, result: TaskResult },
    /// No report came back.
    Dispatch(DispatchError),
}

impl TaskFailure {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Reported { message, .. } => message.clone(),
            Self::Dispatch(err) => err.to_string(),
        }
    }

    #[must_use]
    pub fn result(&self) -> Option<&TaskResult> {
        match self {
            Self::Reported { result, .. } => Some(result),
            Self::Dispatch(_) => None,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported { message, .. } => f.write_str(message),
            Self::Dispatch(err) => write!(f, "{err}"),
        }
    }
}

/// Callbacks for one run.
///
/// For each task `on_start` fires first, then exactly one of `on_result` or
/// `on_failure`. Tasks settle in completion order.
pub trait RunObserver: Send + Sync {
    fn on_start(&self, _task: &TaskDescriptor) {}

    fn on_result(&self, task: &TaskDescriptor, result: &TaskResult);

    fn on_failure(&self, task: &TaskDescriptor, failure: &TaskFailure);
}

/// Tally of how a run's tasks settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    /// Reported failures.
    pub failed: usize,
    pub dispatch_errors: usize,
    /// Set when no host could be started and the remaining tasks were
    /// failed without being dispatched.
    pub aborted: bool,
}

impl RunSummary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.dispatch_errors
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.failed == 0 && self.dispatch_errors == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} not run, {} total",
            self.passed,
            self.failed,
            self.dispatch_errors,
            self.total()
        )
    }
}

#[cfg(test)]
mod tests {
    use fleet_types::PerfStats;

    use super::*;

    #[test]
    fn failure_message_comes_from_the_report_or_the_error() {
        let result = TaskResult::failed("a.test", "expected 1, got 2", PerfStats::default());
        let reported = TaskFailure::Reported {
            message: "expected 1, got 2".into(),
            result: result.clone(),
        };
        assert_eq!(reported.to_string(), "expected 1, got 2");
        assert_eq!(reported.result(), Some(&result));

        let dispatch = TaskFailure::Dispatch(DispatchError::PoolClosed);
        assert_eq!(dispatch.message(), "pool is shut down");
        assert!(dispatch.result().is_none());
    }

    #[test]
    fn summary_counts() {
        let summary = RunSummary {
            passed: 3,
            failed: 1,
            dispatch_errors: 2,
            aborted: false,
        };
        assert_eq!(summary.total(), 6);
        assert!(!summary.success());
        assert_eq!(summary.to_string(), "3 passed, 1 failed, 2 not run, 6 total");
        assert!(RunSummary::default().success());
    }
}
