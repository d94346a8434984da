//! Host Process Pool.
//!
//! The dispatcher side keeps a bounded [`HostPool`] of hosts, each a
//! [`RunningHost`] talking the framed JSON protocol over a pair of byte
//! streams. A host is ready once it sends `Ready`; every `RunTask` carries a
//! correlation id that comes back on the matching `RunTaskResult`.
//!
//! The host side is [`serve`]: it wraps one
//! [`ContextPool`](fleet_context::ContextPool) and answers the dispatcher until
//! its input closes.
//!
//! How a host comes up is a [`HostLauncher`]: [`ProcessLauncher`] spawns the
//! `fleet-host` binary, [`InProcessLauncher`] runs [`serve`] on a task.

mod codec;
mod launcher;
mod pool;
mod process;
mod worker;

pub use codec::{CodecError, FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use launcher::{
    HostControl, HostLauncher, InProcessLauncher, LaunchFut, LaunchedHost, ProcessLauncher,
};
pub use pool::{HostClosed, HostPool, HostPoolConfig, KillOnDrop};
pub use process::RunningHost;
pub use worker::serve;
