//! Core domain types for fleet.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
mod ids;
mod protocol;
mod task;

pub use error::DispatchError;
pub use ids::{CorrelationId, EntryId};
pub use protocol::{ContextMessage, ContextReply, HostEnv, HostMessage};
pub use task::{PerfStats, TaskDescriptor, TaskResult};

use serde::{Deserialize, Serialize};

/// Status of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Eligible for acquisition.
    Idle,
    /// Bound to exactly one in-flight task.
    Busy,
}

impl EntryStatus {
    #[must_use]
    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }
}

/// Outcome delivered to whoever awaits a correlated call.
pub type DispatchResult = Result<TaskResult, DispatchError>;
