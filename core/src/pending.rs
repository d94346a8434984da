//! Correlation table for calls awaiting a reply on a multiplexed channel.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use fleet_types::{CorrelationId, DispatchError, DispatchResult};

/// Receiving half handed to the caller by [`PendingCalls::register`].
pub type PendingReply = oneshot::Receiver<DispatchResult>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("correlation id {0} is already in flight")]
    Duplicate(CorrelationId),
    #[error("channel is shut down")]
    Closed,
}

impl From<RegisterError> for DispatchError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::Duplicate(_) => DispatchError::transport(err.to_string()),
            RegisterError::Closed => DispatchError::PoolClosed,
        }
    }
}

struct Table {
    calls: HashMap<CorrelationId, oneshot::Sender<DispatchResult>>,
    closed: bool,
}

/// In-flight calls keyed by correlation id.
///
/// An entry is removed the instant its reply is delivered, so a late or
/// duplicate reply for the same id finds nothing and is dropped with a
/// warning instead of reaching another caller.
pub struct PendingCalls {
    label: &'static str,
    table: Mutex<Table>,
}

impl PendingCalls {
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            table: Mutex::new(Table {
                calls: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: &CorrelationId) -> Result<PendingReply, RegisterError> {
        let mut table = self.table();
        if table.closed {
            return Err(RegisterError::Closed);
        }
        if table.calls.contains_key(id) {
            return Err(RegisterError::Duplicate(id.clone()));
        }
        let (tx, rx) = oneshot::channel();
        table.calls.insert(id.clone(), tx);
        Ok(rx)
    }

    /// Deliver `outcome` to the caller waiting on `id`.
    ///
    /// Returns `false` for an unknown or already-settled id.
    pub fn resolve(&self, id: &CorrelationId, outcome: DispatchResult) -> bool {
        let sender = self.table().calls.remove(id);
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(
                        channel = self.label,
                        correlation_id = %id,
                        "Caller stopped waiting before the reply arrived"
                    );
                }
                true
            }
            None => {
                tracing::warn!(
                    channel = self.label,
                    correlation_id = %id,
                    "Ignoring reply for unknown or stale correlation id"
                );
                false
            }
        }
    }

    /// Forget `id` without delivering anything.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.table().calls.remove(id).is_some()
    }

    /// Settle every in-flight call with `err` and refuse new registrations.
    pub fn fail_all(&self, err: &DispatchError) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table();
            table.closed = true;
            table.calls.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        if count > 0 {
            tracing::debug!(channel = self.label, count, "Failed in-flight calls: {err}");
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.table().calls.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table().calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the reply registered under `id`.
    ///
    /// With a timeout, expiry removes the entry and yields
    /// [`DispatchError::Timeout`]. A dropped sender means the channel went
    /// away without settling the call.
    pub async fn wait(
        &self,
        id: &CorrelationId,
        reply: PendingReply,
        timeout: Option<Duration>,
    ) -> DispatchResult {
        let started = Instant::now();
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(received) => received,
                Err(_) => {
                    self.cancel(id);
                    return Err(DispatchError::Timeout {
                        elapsed: started.elapsed(),
                    });
                }
            },
            None => reply.await,
        };
        received.unwrap_or_else(|_| {
            self.cancel(id);
            Err(DispatchError::transport("reply channel dropped"))
        })
    }
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("label", &self.label)
            .field("in_flight", &self.len())
            .finish()
    }
}
