//! Execution Context Pool.
//!
//! Lives inside one host process. Each context is an isolated task with its
//! own inbox that runs one [`TaskDescriptor`](fleet_types::TaskDescriptor) at
//! a time through a [`TaskExecutor`]. Replies from every context share one
//! channel and are matched back to their callers by correlation id.

mod executor;
mod pool;
mod surface;

pub use executor::{CommandExecutor, ExecError, ExecFut, SurfaceInfo, TaskExecutor};
pub use pool::{ContextPool, ContextPoolConfig};
