//! The host side of the protocol.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use fleet_context::ContextPool;
use fleet_types::{DispatchResult, HostMessage, TaskDescriptor, TaskResult};

use crate::codec::{CodecError, FrameReader, FrameWriter};

const OUTBOX_CAPACITY: usize = 64;

/// Serve the dispatcher on `reader`/`writer` until it closes the channel.
///
/// Warms one context and emits `Ready`, then runs every `RunTask` as its own
/// task so a host with several contexts works them concurrently. Dispatch
/// errors inside the host become failure-shaped results: the dispatcher
/// always gets a `RunTaskResult` for each `RunTask` while the channel is up.
/// `Replay` reruns each context's recorded tasks and answers with one
/// `ReplayEnd` carrying every result.
pub async fn serve<R, W>(reader: R, writer: W, contexts: ContextPool) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    // Dropping the set on return aborts the writer and any in-flight work.
    let mut tasks = JoinSet::new();
    tasks.spawn(write_frames(writer, outbox_rx));

    if let Err(e) = contexts.warm().await {
        // Keep serving: each task will surface the bring-up failure in its
        // own result.
        tracing::error!("Failed to load the first context: {e}");
    }
    if outbox.send(HostMessage::Ready).await.is_err() {
        contexts.shutdown();
        return Ok(());
    }
    tracing::debug!(contexts = contexts.max_size(), "Host ready");

    let mut frames = FrameReader::new(reader);
    let outcome = loop {
        while tasks.try_join_next().is_some() {}

        let message = match frames.read_frame::<HostMessage>().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!("Dispatcher closed the channel");
                break Ok(());
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Skipping undecodable frame: {e}");
                continue;
            }
            Err(e) => break Err(e),
        };

        match message {
            HostMessage::RunTask {
                task,
                correlation_id,
            } => {
                let contexts = contexts.clone();
                let outbox = outbox.clone();
                tasks.spawn(async move {
                    let outcome = contexts.acquire_and_run(task.clone()).await;
                    let result = settle(&task, outcome);
                    let _ = outbox
                        .send(HostMessage::RunTaskResult {
                            correlation_id,
                            result,
                        })
                        .await;
                });
            }
            HostMessage::InitWindow => {
                let contexts = contexts.clone();
                let outbox = outbox.clone();
                tasks.spawn(async move {
                    if let Err(e) = contexts.warm().await {
                        tracing::warn!("Failed to warm contexts: {e}");
                    }
                    let cleared = contexts.drain_all();
                    tracing::debug!(cleared, "Contexts drained");
                    let _ = outbox.send(HostMessage::InitWindowEnd).await;
                });
            }
            HostMessage::Replay => {
                let contexts = contexts.clone();
                let outbox = outbox.clone();
                tasks.spawn(async move {
                    let results: Vec<TaskResult> = contexts
                        .replay()
                        .await
                        .into_iter()
                        .map(|(task, outcome)| settle(&task, outcome))
                        .collect();
                    tracing::debug!(replayed = results.len(), "Replay finished");
                    let _ = outbox.send(HostMessage::ReplayEnd { results }).await;
                });
            }
            other @ (HostMessage::Ready
            | HostMessage::RunTaskResult { .. }
            | HostMessage::InitWindowEnd
            | HostMessage::ReplayEnd { .. }) => {
                tracing::warn!("Ignoring unexpected {} message from dispatcher", other.kind());
            }
        }
    };

    contexts.shutdown();
    outcome
}

/// Dispatch errors inside the host become failure-shaped results.
fn settle(task: &TaskDescriptor, outcome: DispatchResult) -> TaskResult {
    outcome.unwrap_or_else(|e| {
        tracing::warn!(path = %task.path, "Task dispatch failed: {e}");
        TaskResult::fatal(&task.path, &e.to_string(), &task.config)
    })
}

async fn write_frames<W>(writer: W, mut outbox: mpsc::Receiver<HostMessage>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(writer);
    while let Some(message) = outbox.recv().await {
        if let Err(e) = writer.write_frame(&message).await {
            tracing::warn!("Failed to write {} to dispatcher: {e}", message.kind());
            break;
        }
    }
}
