//! One execution context: a task with a private inbox.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use fleet_types::{ContextMessage, ContextReply, CorrelationId, EntryId, TaskDescriptor, TaskResult};

use crate::executor::{ExecError, SurfaceInfo, TaskExecutor};

/// Sent from surfaces to the pool's reply router.
#[derive(Debug)]
pub(crate) enum SurfaceEvent {
    Reply(ContextReply),
    /// The surface stopped.
    Closed(EntryId),
}

/// Pool-side handle. Dropping it stops the surface.
pub(crate) struct Surface {
    pub(crate) info: SurfaceInfo,
    inbox: mpsc::UnboundedSender<ContextMessage>,
    history: Mutex<Vec<TaskDescriptor>>,
    /// Call currently bound to this surface.
    current: Mutex<Option<CorrelationId>>,
    abort: AbortHandle,
}

impl Surface {
    pub(crate) fn new(
        info: SurfaceInfo,
        inbox: mpsc::UnboundedSender<ContextMessage>,
        abort: AbortHandle,
    ) -> Self {
        Self {
            info,
            inbox,
            history: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            abort,
        }
    }

    pub(crate) fn send(&self, message: ContextMessage) -> bool {
        self.inbox.send(message).is_ok()
    }

    pub(crate) fn bind(&self, correlation_id: Option<CorrelationId>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = correlation_id;
    }

    pub(crate) fn take_bound(&self) -> Option<CorrelationId> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn stop(&self) {
        self.abort.abort();
    }

    pub(crate) fn record(&self, task: TaskDescriptor) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub(crate) fn history(&self) -> Vec<TaskDescriptor> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn clear_history(&self) -> usize {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let cleared = history.len();
        history.clear();
        cleared
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reports the surface's exit however it happens: inbox closed, panic, or
/// abort.
struct ExitNotice {
    id: EntryId,
    events: mpsc::UnboundedSender<SurfaceEvent>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.events.send(SurfaceEvent::Closed(self.id));
    }
}

/// Body of a surface task.
///
/// Signals `loaded` once the executor is prepared, then serves its inbox
/// until the sender goes away.
pub(crate) async fn run(
    info: SurfaceInfo,
    executor: Arc<dyn TaskExecutor>,
    mut inbox: mpsc::UnboundedReceiver<ContextMessage>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    loaded: oneshot::Sender<Result<(), ExecError>>,
) {
    let _notice = ExitNotice {
        id: info.id,
        events: events.clone(),
    };

    let prepared = AssertUnwindSafe(executor.prepare(&info))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ExecError::Failed(panic_message(&*panic))));
    let ready = prepared.is_ok();
    if loaded.send(prepared).is_err() || !ready {
        return;
    }
    tracing::debug!(context = %info.id, display = ?info.display, "Context loaded");

    while let Some(message) = inbox.recv().await {
        match message {
            ContextMessage::StartTask {
                task,
                correlation_id,
            } => {
                let result = execute(executor.as_ref(), &task, &info).await;
                if info.interactive {
                    tracing::info!(
                        context = %info.id,
                        path = %result.test_file_path,
                        failed = result.is_failure(),
                        "Task finished"
                    );
                }
                let reply = ContextReply {
                    correlation_id,
                    result,
                };
                if events.send(SurfaceEvent::Reply(reply)).is_err() {
                    break;
                }
            }
        }
    }
}

async fn execute(executor: &dyn TaskExecutor, task: &TaskDescriptor, info: &SurfaceInfo) -> TaskResult {
    let outcome = AssertUnwindSafe(executor.execute(task, info))
        .catch_unwind()
        .await;
    let error = match outcome {
        Ok(Ok(result)) => return result,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("executor panicked: {}", panic_message(&*panic)),
    };
    tracing::warn!(context = %info.id, path = %task.path, "Executor failed: {error}");
    TaskResult::fatal(&task.path, &error, &task.config)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
