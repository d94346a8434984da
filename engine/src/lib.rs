//! Dispatcher for fleet.
//!
//! [`Runner::run_tasks`] sizes a [`HostPool`](fleet_host::HostPool) from
//! [`get_concurrency`], keeps that many tasks in flight, and reports each
//! task to a [`RunObserver`] exactly once. Interactive runs hand back an
//! [`InteractiveSession`] that owns the still-running host.

mod observer;
mod runner;

pub use observer::{RunObserver, RunSummary, TaskFailure};
pub use runner::{InteractiveSession, RunReport, Runner, RunnerConfig, get_concurrency};
