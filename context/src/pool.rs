//! Bounded pool of execution contexts living inside one host.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use fleet_config::DisplayStore;
use fleet_core::{EntrySnapshot, PendingCalls, Pool, WeakPool};
use fleet_types::{
    ContextMessage, CorrelationId, DispatchError, DispatchResult, EntryId, HostEnv,
    TaskDescriptor,
};

use crate::executor::{SurfaceInfo, TaskExecutor};
use crate::surface::{self, Surface, SurfaceEvent};

#[derive(Debug, Clone)]
pub struct ContextPoolConfig {
    pub max_size: usize,
    /// Debug mode: a single context that logs every result it presents.
    pub interactive: bool,
    /// `None` waits for a result forever.
    pub task_timeout: Option<Duration>,
    pub startup_timeout: Duration,
    /// Consulted for the display size of each new context.
    pub display: Option<Arc<DisplayStore>>,
}

impl Default for ContextPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 1,
            interactive: false,
            task_timeout: None,
            startup_timeout: Duration::from_secs(30),
            display: None,
        }
    }
}

impl ContextPoolConfig {
    /// Ceiling and mode as handed to a host process.
    #[must_use]
    pub fn for_host(env: HostEnv) -> Self {
        Self {
            max_size: env.context_concurrency,
            interactive: env.interactive,
            ..Self::default()
        }
    }

    fn effective_max_size(&self) -> usize {
        if self.interactive { 1 } else { self.max_size.max(1) }
    }
}

struct Shared {
    config: ContextPoolConfig,
    pool: Pool<Surface>,
    pending: Arc<PendingCalls>,
    executor: Arc<dyn TaskExecutor>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    /// Router and surfaces. Dropping the set aborts them all.
    tasks: Mutex<JoinSet<()>>,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool of execution contexts inside one host.
///
/// Cloning is cheap; clones share the same contexts.
#[derive(Clone)]
pub struct ContextPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("pool", &self.shared.pool)
            .field("pending", &self.shared.pending)
            .finish_non_exhaustive()
    }
}

impl ContextPool {
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: ContextPoolConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        let pool = Pool::new("context", config.effective_max_size());
        let pending = Arc::new(PendingCalls::new("context"));
        let (events, events_rx) = mpsc::unbounded_channel();

        let mut tasks = JoinSet::new();
        tasks.spawn(route_events(
            events_rx,
            Arc::clone(&pending),
            pool.downgrade(),
        ));

        Self {
            shared: Arc::new(Shared {
                config,
                pool,
                pending,
                executor,
                events,
                tasks: Mutex::new(tasks),
            }),
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.shared.pool.max_size()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.pool.size()
    }

    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.shared.pool.busy_count()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.shared.pool.entries()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.pool.is_closed()
    }

    /// Tasks recorded across all contexts since the last drain.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.shared
            .pool
            .handles()
            .iter()
            .map(|s| s.history().len())
            .sum()
    }

    /// Acquire a context, run `task` on it, and release it.
    ///
    /// A timeout or a lost context discards the entry instead of releasing
    /// it, so a wedged context never serves another task. Completed tasks
    /// are recorded for [`replay`](Self::replay).
    pub async fn acquire_and_run(&self, task: TaskDescriptor) -> DispatchResult {
        self.dispatch(task, true).await
    }

    /// Run each context's recorded tasks again, one at a time per context.
    ///
    /// Contexts replay concurrently. Replayed tasks are not recorded a second
    /// time. Outcomes come back in history order per context.
    pub async fn replay(&self) -> Vec<(TaskDescriptor, DispatchResult)> {
        let histories: Vec<Vec<TaskDescriptor>> = self
            .shared
            .pool
            .handles()
            .iter()
            .map(|surface| surface.history())
            .filter(|history| !history.is_empty())
            .collect();
        tracing::debug!(
            contexts = histories.len(),
            tasks = histories.iter().map(Vec::len).sum::<usize>(),
            "Replaying recorded tasks"
        );

        let replays = histories.into_iter().map(|history| async move {
            let mut settled = Vec::with_capacity(history.len());
            for task in history {
                let outcome = self.dispatch(task.clone(), false).await;
                settled.push((task, outcome));
            }
            settled
        });
        join_all(replays).await.into_iter().flatten().collect()
    }

    async fn dispatch(&self, task: TaskDescriptor, record: bool) -> DispatchResult {
        let shared = &self.shared;
        let lease = shared.pool.acquire(|id| self.create_surface(id)).await?;
        let surface = Arc::clone(lease.handle());
        let id = surface.info.id;

        let correlation_id = CorrelationId::mint();
        let reply = shared.pending.register(&correlation_id)?;
        let recorded = task.clone();
        tracing::debug!(context = %id, correlation_id = %correlation_id, path = %task.path, "Starting task");

        surface.bind(Some(correlation_id.clone()));
        let sent = surface.send(ContextMessage::StartTask {
            task,
            correlation_id: correlation_id.clone(),
        });
        if !sent {
            surface.bind(None);
            shared.pending.cancel(&correlation_id);
            lease.discard();
            return Err(DispatchError::transport(format!(
                "context {id} stopped before the task was sent"
            )));
        }

        let outcome = shared
            .pending
            .wait(&correlation_id, reply, shared.config.task_timeout)
            .await;
        surface.bind(None);
        match &outcome {
            Ok(_) => {
                if record {
                    surface.record(recorded);
                }
                lease.release();
            }
            Err(DispatchError::PoolClosed) => lease.release(),
            Err(err) => {
                tracing::warn!(context = %id, path = %recorded.path, "Discarding context: {err}");
                lease.discard();
                surface.stop();
            }
        }
        outcome
    }

    /// Make sure at least one context is loaded.
    pub async fn warm(&self) -> Result<(), DispatchError> {
        if self.shared.pool.size() > 0 {
            return Ok(());
        }
        let lease = self
            .shared
            .pool
            .acquire(|id| self.create_surface(id))
            .await?;
        lease.release();
        Ok(())
    }

    /// Forget recorded task history. Returns the number of entries dropped.
    pub fn drain_all(&self) -> usize {
        self.shared
            .pool
            .handles()
            .iter()
            .map(|surface| surface.clear_history())
            .sum()
    }

    /// Close the pool, fail in-flight calls, and stop every context.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let surfaces = shared.pool.close();
        let failed = shared.pending.fail_all(&DispatchError::PoolClosed);
        for surface in &surfaces {
            surface.stop();
        }
        shared.tasks().abort_all();
        tracing::debug!(contexts = surfaces.len(), failed, "Context pool shut down");
    }

    async fn create_surface(&self, id: EntryId) -> Result<Surface, DispatchError> {
        let shared = &self.shared;
        let info = SurfaceInfo {
            id,
            display: shared
                .config
                .display
                .as_ref()
                .map(|store| store.read())
                .unwrap_or_default(),
            interactive: shared.config.interactive,
        };

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (loaded, loaded_rx) = oneshot::channel();
        let abort = {
            let mut tasks = shared.tasks();
            while tasks.try_join_next().is_some() {}
            tasks.spawn(surface::run(
                info,
                Arc::clone(&shared.executor),
                inbox_rx,
                shared.events.clone(),
                loaded,
            ))
        };
        // Dropping this on any error path below stops the surface.
        let surface = Surface::new(info, inbox, abort);

        let limit = shared.config.startup_timeout;
        match tokio::time::timeout(limit, loaded_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(context = %id, "Created context");
                Ok(surface)
            }
            Ok(Ok(Err(e))) => Err(DispatchError::startup("context", e.to_string())),
            Ok(Err(_)) => Err(DispatchError::startup("context", "exited during bring-up")),
            Err(_) => Err(DispatchError::startup(
                "context",
                format!("not loaded after {}ms", limit.as_millis()),
            )),
        }
    }
}

/// Resolve replies by correlation id and evict contexts that stop.
async fn route_events(
    mut events: mpsc::UnboundedReceiver<SurfaceEvent>,
    pending: Arc<PendingCalls>,
    pool: WeakPool<Surface>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SurfaceEvent::Reply(reply) => {
                pending.resolve(&reply.correlation_id, Ok(reply.result));
            }
            SurfaceEvent::Closed(id) => {
                // Already gone when the pool discarded it or shut down.
                let Some(surface) = pool.upgrade().and_then(|pool| pool.remove(id)) else {
                    continue;
                };
                tracing::warn!(context = %id, "Context closed unexpectedly; removed from pool");
                if let Some(correlation_id) = surface.take_bound() {
                    pending.resolve(
                        &correlation_id,
                        Err(DispatchError::transport(format!(
                            "context {id} closed mid-task"
                        ))),
                    );
                }
            }
        }
    }
}
