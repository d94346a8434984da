//! Dispatcher-side handle for one launched host.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use fleet_core::PendingCalls;
use fleet_types::{
    CorrelationId, DispatchError, DispatchResult, EntryId, HostEnv, HostMessage, TaskDescriptor,
    TaskResult,
};

use crate::codec::{FrameReader, FrameWriter};
use crate::launcher::{HostControl, HostLauncher};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Called once when the host's output stream ends, for whatever reason.
pub(crate) type ExitHook = Box<dyn FnOnce(EntryId) + Send>;

/// Callers waiting on an end-of-exchange reply, oldest first.
type Waiters<T> = Arc<Mutex<VecDeque<oneshot::Sender<T>>>>;

fn lock_waiters<T>(waiters: &Waiters<T>) -> MutexGuard<'_, VecDeque<oneshot::Sender<T>>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wake_oldest<T>(host: EntryId, waiters: &Waiters<T>, value: T, kind: &str) {
    match lock_waiters(waiters).pop_front() {
        Some(tx) => {
            let _ = tx.send(value);
        }
        None => tracing::warn!(host = %host, "{kind} with nobody waiting"),
    }
}

pub struct RunningHost {
    id: EntryId,
    writer_tx: mpsc::Sender<HostMessage>,
    pending: Arc<PendingCalls>,
    init_waiters: Waiters<()>,
    replay_waiters: Waiters<Vec<TaskResult>>,
    exited: Arc<AtomicBool>,
    control: Box<dyn HostControl>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl std::fmt::Debug for RunningHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningHost")
            .field("id", &self.id)
            .field("pid", &self.control.pid())
            .field("exited", &self.has_exited())
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl RunningHost {
    /// Launch a host and wait for its `Ready`.
    ///
    /// `on_exit` fires when the host's output ends, including when a failed
    /// bring-up is torn down.
    pub(crate) async fn start(
        id: EntryId,
        launcher: &dyn HostLauncher,
        env: HostEnv,
        startup_timeout: Duration,
        on_exit: ExitHook,
    ) -> Result<Self, DispatchError> {
        let launched = launcher.launch(id, env).await?;

        let pending = Arc::new(PendingCalls::new("host"));
        let init_waiters: Waiters<()> = Arc::new(Mutex::new(VecDeque::new()));
        let replay_waiters: Waiters<Vec<TaskResult>> = Arc::new(Mutex::new(VecDeque::new()));
        let exited = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(write_frames(id, launched.writer, writer_rx));
        let reader_handle = tokio::spawn(read_frames(
            id,
            launched.reader,
            ReaderState {
                host: id,
                pending: Arc::clone(&pending),
                init_waiters: Arc::clone(&init_waiters),
                replay_waiters: Arc::clone(&replay_waiters),
                exited: Arc::clone(&exited),
                ready: Some(ready_tx),
                on_exit: Some(on_exit),
            },
        ));

        let host = Self {
            id,
            writer_tx,
            pending,
            init_waiters,
            replay_waiters,
            exited,
            control: launched.control,
            reader_handle,
            writer_handle,
        };

        // Dropping `host` on the error paths kills what was launched.
        match tokio::time::timeout(startup_timeout, ready_rx).await {
            Ok(Ok(())) => {
                tracing::info!(host = %id, pid = host.control.pid(), "Host ready");
                Ok(host)
            }
            Ok(Err(_)) => Err(DispatchError::startup(
                "host",
                format!("host {id} exited before it was ready"),
            )),
            Err(_) => Err(DispatchError::startup(
                "host",
                format!(
                    "host {id} not ready after {}ms",
                    startup_timeout.as_millis()
                ),
            )),
        }
    }

    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Send one task and wait for the result carrying its correlation id.
    pub async fn run_task(
        &self,
        task: TaskDescriptor,
        timeout: Option<Duration>,
    ) -> DispatchResult {
        let correlation_id = CorrelationId::mint();
        let reply = self.pending.register(&correlation_id)?;
        tracing::debug!(host = %self.id, correlation_id = %correlation_id, path = %task.path, "Sending task");

        let message = HostMessage::RunTask {
            task,
            correlation_id: correlation_id.clone(),
        };
        if self.writer_tx.send(message).await.is_err() {
            self.pending.cancel(&correlation_id);
            return Err(DispatchError::transport(format!(
                "host {} writer closed",
                self.id
            )));
        }

        self.pending.wait(&correlation_id, reply, timeout).await
    }

    /// Ask the host to warm and drain its contexts.
    pub async fn init_window(&self, timeout: Duration) -> Result<(), DispatchError> {
        self.exchange(HostMessage::InitWindow, &self.init_waiters, Some(timeout))
            .await
    }

    /// Ask the host to rerun its recorded tasks; returns their results.
    pub async fn replay(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<TaskResult>, DispatchError> {
        self.exchange(HostMessage::Replay, &self.replay_waiters, timeout)
            .await
    }

    /// Send `request` and wait for the matching end-of-exchange reply.
    async fn exchange<T>(
        &self,
        request: HostMessage,
        waiters: &Waiters<T>,
        timeout: Option<Duration>,
    ) -> Result<T, DispatchError> {
        let (tx, rx) = oneshot::channel();
        lock_waiters(waiters).push_back(tx);
        if self.writer_tx.send(request).await.is_err() {
            return Err(DispatchError::transport(format!(
                "host {} writer closed",
                self.id
            )));
        }
        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| DispatchError::Timeout { elapsed: limit })?,
            None => rx.await,
        };
        reply.map_err(|_| DispatchError::HostExited { host: self.id })
    }

    /// Settle every in-flight call on this host with `err`.
    pub fn fail_pending(&self, err: &DispatchError) -> usize {
        self.pending.fail_all(err)
    }

    pub fn kill(&self) {
        tracing::debug!(host = %self.id, pid = self.control.pid(), "Killing host");
        self.control.kill();
    }
}

impl Drop for RunningHost {
    fn drop(&mut self) {
        self.control.kill();
        self.writer_handle.abort();
        self.reader_handle.abort();
    }
}

struct ReaderState {
    host: EntryId,
    pending: Arc<PendingCalls>,
    init_waiters: Waiters<()>,
    replay_waiters: Waiters<Vec<TaskResult>>,
    exited: Arc<AtomicBool>,
    ready: Option<oneshot::Sender<()>>,
    on_exit: Option<ExitHook>,
}

impl ReaderState {
    fn handle(&mut self, id: EntryId, message: HostMessage) {
        match message {
            HostMessage::Ready => match self.ready.take() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => tracing::warn!(host = %id, "Duplicate Ready ignored"),
            },
            HostMessage::RunTaskResult {
                correlation_id,
                result,
            } => {
                self.pending.resolve(&correlation_id, Ok(result));
            }
            HostMessage::InitWindowEnd => {
                wake_oldest(id, &self.init_waiters, (), "InitWindowEnd");
            }
            HostMessage::ReplayEnd { results } => {
                wake_oldest(id, &self.replay_waiters, results, "ReplayEnd");
            }
            other @ (HostMessage::RunTask { .. } | HostMessage::InitWindow | HostMessage::Replay) => {
                tracing::warn!(host = %id, "Ignoring unexpected {} message from host", other.kind());
            }
        }
    }
}

// Also runs when the reader task is aborted, so callers never hang on a
// host that was torn down from our side.
impl Drop for ReaderState {
    fn drop(&mut self) {
        self.exited.store(true, Ordering::Release);
        lock_waiters(&self.init_waiters).clear();
        lock_waiters(&self.replay_waiters).clear();
        self.pending.fail_all(&DispatchError::HostExited { host: self.host });
    }
}

async fn read_frames(
    id: EntryId,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    mut state: ReaderState,
) {
    let mut frames = FrameReader::new(reader);
    loop {
        match frames.read_frame::<HostMessage>().await {
            Ok(Some(message)) => state.handle(id, message),
            Ok(None) => {
                tracing::debug!(host = %id, "Host closed its output");
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(host = %id, "Skipping undecodable frame: {e}");
            }
            Err(e) => {
                tracing::warn!(host = %id, "Host output failed: {e}");
                break;
            }
        }
    }

    let in_flight = state.pending.len();
    if in_flight > 0 {
        tracing::warn!(host = %id, in_flight, "Host exited with tasks in flight");
    }
    // Hook first, while the host is still pooled; callers wake after.
    state.exited.store(true, Ordering::Release);
    if let Some(on_exit) = state.on_exit.take() {
        on_exit(id);
    }
    drop(state);
}

async fn write_frames(
    id: EntryId,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::Receiver<HostMessage>,
) {
    let mut frames = FrameWriter::new(writer);
    while let Some(message) = rx.recv().await {
        if let Err(e) = frames.write_frame(&message).await {
            tracing::warn!(host = %id, "Failed to write {}: {e}", message.kind());
            break;
        }
    }
}
