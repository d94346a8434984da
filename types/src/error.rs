use std::time::Duration;

use thiserror::Error;

use crate::ids::EntryId;

/// Why a dispatched task produced no result.
///
/// These are transport-level outcomes. A task that ran and failed is not an
/// error here; it comes back as a `TaskResult` with a failure message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The channel to a host or context closed or errored mid-flight.
    #[error("transport failure: {reason}")]
    Transport { reason: String },
    /// No result arrived within the configured task timeout.
    #[error("no result after {}ms", elapsed.as_millis())]
    Timeout { elapsed: Duration },
    /// The host process bound to the task exited without being killed.
    #[error("host {host} exited while the task was in flight")]
    HostExited { host: EntryId },
    /// The pool was torn down before the task settled.
    #[error("pool is shut down")]
    PoolClosed,
    /// A host or context could not be brought up.
    #[error("failed to start {what}: {reason}")]
    Startup { what: &'static str, reason: String },
}

impl DispatchError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn startup(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Startup {
            what,
            reason: reason.into(),
        }
    }
}
