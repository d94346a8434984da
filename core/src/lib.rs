//! Shared machinery for both pool levels.
//!
//! - [`Pool`] owns a bounded list of entries tagged Idle/Busy and hands them
//!   out as [`Lease`]s. Waiters queue FIFO on a capacity semaphore; the entry
//!   list itself is only touched under one mutex, so two acquirers can never
//!   claim the same idle entry or both create into the last free slot.
//! - [`PendingCalls`] is the correlation table that matches replies on a
//!   multiplexed channel back to the call that issued the request.

mod pending;
mod pool;

pub use pending::{PendingCalls, PendingReply, RegisterError};
pub use pool::{EntrySnapshot, Lease, Pool, WeakPool};
