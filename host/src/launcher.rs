//! How a host comes into existence.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinSet};

use fleet_context::{ContextPool, ContextPoolConfig, TaskExecutor};
use fleet_types::{DispatchError, EntryId, HostEnv};

use crate::worker;

pub type LaunchFut<'a> = Pin<Box<dyn Future<Output = Result<LaunchedHost, DispatchError>> + Send + 'a>>;

/// Terminates a launched host. Must be idempotent.
pub trait HostControl: Send + Sync {
    fn kill(&self);

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// The dispatcher's ends of a freshly launched host.
pub struct LaunchedHost {
    /// Host → dispatcher.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Dispatcher → host.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub control: Box<dyn HostControl>,
}

pub trait HostLauncher: Send + Sync {
    fn launch(&self, id: EntryId, env: HostEnv) -> LaunchFut<'_>;
}

/// Spawns the host binary as a child process speaking the protocol on its
/// stdin and stdout. stderr is inherited so host logs stay visible.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub const HOST_BINARY: &'static str = "fleet-host";

    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// The host binary installed next to the running executable, else the
    /// one on `PATH`.
    pub fn locate() -> Result<Self, DispatchError> {
        let name = format!("{}{}", Self::HOST_BINARY, std::env::consts::EXE_SUFFIX);
        if let Ok(exe) = std::env::current_exe() {
            let sibling = exe.with_file_name(&name);
            if sibling.is_file() {
                return Ok(Self::new(sibling));
            }
        }
        which::which(Self::HOST_BINARY)
            .map(Self::new)
            .map_err(|e| DispatchError::startup("host", format!("{} not found: {e}", Self::HOST_BINARY)))
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn spawn(&self, env: HostEnv) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(env.to_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Own process group, so a kill also reaches whatever the host spawned.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
    }
}

impl HostLauncher for ProcessLauncher {
    fn launch(&self, id: EntryId, env: HostEnv) -> LaunchFut<'_> {
        Box::pin(async move {
            let mut child = self.spawn(env).map_err(|e| {
                DispatchError::startup("host", format!("spawning {}: {e}", self.program.display()))
            })?;
            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return Err(DispatchError::startup("host", "child has no stdio pipes"));
            };
            let pid = child.id();
            tracing::debug!(host = %id, pid, "Spawned host process");

            Ok(LaunchedHost {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                control: Box::new(ChildControl {
                    pid,
                    child: Mutex::new(Some(child)),
                }),
            })
        })
    }
}

struct ChildControl {
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
}

impl HostControl for ChildControl {
    fn kill(&self) {
        let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // Spawned as a group leader, so the group id is the pid.
            let killed = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } == 0;
            if killed {
                let _ = child.try_wait();
                return;
            }
        }
        let _ = child.start_kill();
        let _ = child.try_wait();
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ChildControl {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs the worker loop on a tokio task over an in-memory duplex pipe.
///
/// Behaves like a real host, minus the process boundary. Dropping the
/// launcher stops every host it started.
pub struct InProcessLauncher {
    executor: Arc<dyn TaskExecutor>,
    template: ContextPoolConfig,
    hosts: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for InProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLauncher")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

const DUPLEX_BUFFER: usize = 256 * 1024;

impl InProcessLauncher {
    #[must_use]
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_template(executor, ContextPoolConfig::default())
    }

    /// `template` supplies timeouts and the display store. Ceiling and mode
    /// come from the [`HostEnv`] of each launch.
    #[must_use]
    pub fn with_template(executor: Arc<dyn TaskExecutor>, template: ContextPoolConfig) -> Self {
        Self {
            executor,
            template,
            hosts: Mutex::new(JoinSet::new()),
        }
    }
}

impl HostLauncher for InProcessLauncher {
    fn launch(&self, id: EntryId, env: HostEnv) -> LaunchFut<'_> {
        Box::pin(async move {
            let config = ContextPoolConfig {
                max_size: env.context_concurrency,
                interactive: env.interactive,
                ..self.template.clone()
            };
            let contexts = ContextPool::new(config, Arc::clone(&self.executor));

            let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
            let (their_read, their_write) = tokio::io::split(theirs);
            let abort = {
                let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
                while hosts.try_join_next().is_some() {}
                hosts.spawn(async move {
                    if let Err(e) = worker::serve(their_read, their_write, contexts).await {
                        tracing::warn!(host = %id, "In-process host stopped: {e}");
                    }
                })
            };

            let (read, write) = tokio::io::split(ours);
            Ok(LaunchedHost {
                reader: Box::new(read),
                writer: Box::new(write),
                control: Box::new(TaskControl { abort }),
            })
        })
    }
}

struct TaskControl {
    abort: AbortHandle,
}

impl HostControl for TaskControl {
    fn kill(&self) {
        self.abort.abort();
    }
}
