//! Shared infrastructure utilities for fleet.
//!
//! - **`backoff`**: Cooperative delay and bounded retry with exponential backoff
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename)

pub mod atomic_write;
pub mod backoff;

pub use atomic_write::{FileSyncPolicy, atomic_write, atomic_write_with_policy};
pub use backoff::{BackoffPolicy, delay, retry};
