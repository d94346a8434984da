//! Integration test modules

#[cfg(unix)]
mod cli;
#[cfg(unix)]
mod host_process;
#[cfg(unix)]
mod protocol;
