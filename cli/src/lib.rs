//! Glue shared by the `fleet` and `fleet-host` binaries.

pub mod args;
pub mod logging;
pub mod report;

pub use args::Args;
pub use report::ConsoleReporter;
