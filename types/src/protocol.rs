//! Messages exchanged across the two dispatch boundaries.
//!
//! [`HostMessage`] travels between the dispatcher and a host process (JSON,
//! one frame per message). [`ContextMessage`] and [`ContextReply`] travel
//! between a host's context pool and its execution contexts. Each channel has
//! its own closed set of variants, so receivers match exhaustively.

use serde::{Deserialize, Serialize};

use crate::ids::CorrelationId;
use crate::task::{TaskDescriptor, TaskResult};

/// Process-boundary envelope, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    /// Host → dispatcher: the host finished bring-up and accepts work.
    Ready,
    /// Dispatcher → host: run one task.
    RunTask {
        task: TaskDescriptor,
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
    },
    /// Host → dispatcher: result for the `RunTask` carrying the same id.
    RunTaskResult {
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        result: TaskResult,
    },
    /// Dispatcher → host: prepare contexts for a new run.
    InitWindow,
    /// Host → dispatcher: `InitWindow` handled.
    InitWindowEnd,
    /// Dispatcher → host: run every context's recorded tasks again.
    Replay,
    /// Host → dispatcher: results of a `Replay`, in history order per
    /// context.
    ReplayEnd { results: Vec<TaskResult> },
}

impl HostMessage {
    /// Wire name of the variant, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::RunTask { .. } => "RunTask",
            Self::RunTaskResult { .. } => "RunTaskResult",
            Self::InitWindow => "InitWindow",
            Self::InitWindowEnd => "InitWindowEnd",
            Self::Replay => "Replay",
            Self::ReplayEnd { .. } => "ReplayEnd",
        }
    }
}

/// Host → context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContextMessage {
    StartTask {
        task: TaskDescriptor,
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
    },
}

/// Context → host. Routed by `correlation_id` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextReply {
    #[serde(rename = "correlationId")]
    pub correlation_id: CorrelationId,
    pub result: TaskResult,
}

/// Environment handed to a spawned host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEnv {
    pub interactive: bool,
    /// Context ceiling inside the host, at least 1.
    pub context_concurrency: usize,
}

impl HostEnv {
    pub const INTERACTIVE_VAR: &'static str = "FLEET_INTERACTIVE";
    pub const CONCURRENCY_VAR: &'static str = "FLEET_CONTEXT_CONCURRENCY";

    #[must_use]
    pub fn new(interactive: bool, context_concurrency: usize) -> Self {
        Self {
            interactive,
            context_concurrency: context_concurrency.max(1),
        }
    }

    /// Variables to set on the child process.
    #[must_use]
    pub fn to_vars(&self) -> [(&'static str, String); 2] {
        [
            (
                Self::INTERACTIVE_VAR,
                if self.interactive { "1" } else { "" }.to_string(),
            ),
            (Self::CONCURRENCY_VAR, self.context_concurrency.to_string()),
        ]
    }

    /// Parse from variable lookups. Missing or malformed values fall back to
    /// batch mode with one context.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let interactive = lookup(Self::INTERACTIVE_VAR)
            .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));
        let context_concurrency = lookup(Self::CONCURRENCY_VAR)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1);
        Self::new(interactive, context_concurrency)
    }
}

impl Default for HostEnv {
    fn default() -> Self {
        Self::new(false, 1)
    }
}
