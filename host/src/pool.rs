//! Dispatcher-side pool of host processes.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;

use fleet_core::{EntrySnapshot, Pool};
use fleet_types::{DispatchError, DispatchResult, EntryId, HostEnv, TaskDescriptor, TaskResult};
use fleet_utils::{BackoffPolicy, retry};

use crate::launcher::HostLauncher;
use crate::process::RunningHost;

#[derive(Debug, Clone)]
pub struct HostPoolConfig {
    /// Host ceiling before the interactive override.
    pub max_size: usize,
    /// Exactly one visible host, for debugging.
    pub interactive: bool,
    pub contexts_per_host: usize,
    /// `None` waits for a result forever.
    pub task_timeout: Option<Duration>,
    /// Bound on spawn plus `Ready`, and on each `InitWindow` round-trip.
    pub startup_timeout: Duration,
    pub spawn_backoff: BackoffPolicy,
}

impl Default for HostPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 1,
            interactive: false,
            contexts_per_host: 1,
            task_timeout: None,
            startup_timeout: Duration::from_secs(30),
            spawn_backoff: BackoffPolicy::default(),
        }
    }
}

impl HostPoolConfig {
    #[must_use]
    pub fn effective_max_size(&self) -> usize {
        if self.interactive { 1 } else { self.max_size.max(1) }
    }

    #[must_use]
    pub fn host_env(&self) -> HostEnv {
        HostEnv::new(self.interactive, self.contexts_per_host)
    }
}

/// A host went away without the pool killing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostClosed {
    pub host: EntryId,
    /// Hosts still in the pool after this one was removed.
    pub remaining: usize,
}

type CloseHook = Arc<dyn Fn(HostClosed) + Send + Sync>;

struct Shared {
    config: HostPoolConfig,
    pool: Pool<RunningHost>,
    launcher: Arc<dyn HostLauncher>,
    on_close: Mutex<Option<CloseHook>>,
}

/// Bounded pool of host processes, owned by the dispatcher.
///
/// Cloning is cheap; clones share the same hosts.
#[derive(Clone)]
pub struct HostPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("config", &self.shared.config)
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl HostPool {
    #[must_use]
    pub fn new(config: HostPoolConfig, launcher: Arc<dyn HostLauncher>) -> Self {
        let pool = Pool::new("host", config.effective_max_size());
        Self {
            shared: Arc::new(Shared {
                config,
                pool,
                launcher,
                on_close: Mutex::new(None),
            }),
        }
    }

    /// Register the callback fired when a host exits on its own.
    ///
    /// Replaces any earlier callback. Not fired for hosts the pool kills or
    /// discards itself.
    pub fn on_close(&self, hook: impl Fn(HostClosed) + Send + Sync + 'static) {
        *self
            .shared
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    #[must_use]
    pub fn config(&self) -> &HostPoolConfig {
        &self.shared.config
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

    /// Process ids of live hosts, where the launcher exposes them.
    #[must_use]
    pub fn pids(&self) -> Vec<u32> {
        self.shared
            .pool
            .handles()
            .iter()
            .filter_map(|host| host.pid())
            .collect()
    }

    /// Run `task` on an idle host, starting one if there is room.
    ///
    /// The host goes back to Idle after a result, a reported failure
    /// included. A host that timed out or lost its channel is discarded and
    /// killed; the next acquire starts a fresh one in its slot.
    pub async fn run_task(&self, task: TaskDescriptor) -> DispatchResult {
        let shared = &self.shared;
        let lease = shared.pool.acquire(|id| self.start_host(id)).await?;
        let host = Arc::clone(lease.handle());
        let path = task.path.clone();

        let outcome = host.run_task(task, shared.config.task_timeout).await;
        match &outcome {
            Ok(_) | Err(DispatchError::PoolClosed) => lease.release(),
            Err(err) => {
                tracing::warn!(host = %host.id(), path = %path, "Discarding host: {err}");
                lease.discard();
                host.kill();
            }
        }
        outcome
    }

    /// Ask every live host to warm its contexts and drop their task history.
    ///
    /// Returns how many hosts acknowledged.
    pub async fn init_window(&self) -> usize {
        let hosts = self.shared.pool.handles();
        let timeout = self.shared.config.startup_timeout;
        let outcomes = join_all(hosts.iter().map(|host| host.init_window(timeout))).await;

        let mut acknowledged = 0;
        for (host, outcome) in hosts.iter().zip(outcomes) {
            match outcome {
                Ok(()) => acknowledged += 1,
                Err(e) => tracing::warn!(host = %host.id(), "InitWindow failed: {e}"),
            }
        }
        acknowledged
    }

    /// Ask every live host to rerun the tasks its contexts recorded since
    /// the last [`init_window`](Self::init_window).
    ///
    /// Each replayed task is bounded by the host's own task timeout. Hosts
    /// that fail to answer are logged and contribute nothing.
    pub async fn replay(&self) -> Vec<TaskResult> {
        let hosts = self.shared.pool.handles();
        let outcomes = join_all(hosts.iter().map(|host| host.replay(None))).await;

        let mut results = Vec::new();
        for (host, outcome) in hosts.iter().zip(outcomes) {
            match outcome {
                Ok(replayed) => results.extend(replayed),
                Err(e) => tracing::warn!(host = %host.id(), "Replay failed: {e}"),
            }
        }
        results
    }

    /// Terminate every host, busy or idle.
    ///
    /// In-flight callers get [`DispatchError::PoolClosed`], waiting acquirers
    /// too. Safe to call more than once; later calls find nothing to kill.
    pub fn kill(&self) -> usize {
        let hosts = self.shared.pool.close();
        let mut failed = 0;
        for host in &hosts {
            failed += host.fail_pending(&DispatchError::PoolClosed);
            host.kill();
        }
        if !hosts.is_empty() {
            tracing::info!(hosts = hosts.len(), failed, "Killed host pool");
        }
        hosts.len()
    }

    /// Alias of [`HostPool::kill`].
    pub fn flush(&self) -> usize {
        self.kill()
    }

    /// Kill the pool when the returned guard drops, unless disarmed.
    #[must_use]
    pub fn kill_on_drop(&self) -> KillOnDrop {
        KillOnDrop {
            pool: Some(self.clone()),
        }
    }

    async fn start_host(&self, id: EntryId) -> Result<RunningHost, DispatchError> {
        let shared = &self.shared;
        let env = shared.config.host_env();
        retry(&shared.config.spawn_backoff, "Host start", move |_attempt| {
            let weak = Arc::downgrade(shared);
            RunningHost::start(
                id,
                shared.launcher.as_ref(),
                env,
                shared.config.startup_timeout,
                Box::new(move |id| host_exited(&weak, id)),
            )
        })
        .await
    }
}

fn host_exited(shared: &Weak<Shared>, id: EntryId) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    // Gone already when the pool discarded or killed it.
    if shared.pool.remove(id).is_none() {
        return;
    }
    let remaining = shared.pool.size();
    tracing::warn!(host = %id, remaining, "Host exited unexpectedly; removed from pool");

    let hook = shared
        .on_close
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(hook) = hook {
        hook(HostClosed { host: id, remaining });
    }
}

/// Kills its pool on drop. Covers early returns and unwinding in the
/// dispatcher so no host outlives it.
#[derive(Debug)]
pub struct KillOnDrop {
    pool: Option<HostPool>,
}

impl KillOnDrop {
    /// Leave the pool running.
    pub fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleet_context::{ContextPoolConfig, ExecFut, SurfaceInfo, TaskExecutor};
    use fleet_types::{PerfStats, TaskResult};

    use super::*;
    use crate::launcher::{HostControl, InProcessLauncher, LaunchFut};

    /// Echoes the path. Paths starting with `hang` never finish, `fail`
    /// reports a failure.
    #[derive(Default)]
    struct Echo {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TaskExecutor for Echo {
        fn execute<'a>(
            &'a self,
            task: &'a TaskDescriptor,
            _surface: &'a SurfaceInfo,
        ) -> ExecFut<'a, TaskResult> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                if task.path.starts_with("hang") {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                if task.path.starts_with("fail") {
                    return Ok(TaskResult::failed(&task.path, "boom", PerfStats::default()));
                }
                Ok(TaskResult::passed(&task.path, PerfStats::default()))
            })
        }
    }

    fn pool_with(config: HostPoolConfig, executor: Arc<Echo>) -> (HostPool, Arc<InProcessLauncher>) {
        let launcher = Arc::new(InProcessLauncher::with_template(
            executor,
            ContextPoolConfig {
                startup_timeout: Duration::from_secs(5),
                ..ContextPoolConfig::default()
            },
        ));
        let pool = HostPool::new(config, Arc::clone(&launcher) as Arc<dyn HostLauncher>);
        (pool, launcher)
    }

    fn config(max_size: usize) -> HostPoolConfig {
        HostPoolConfig {
            max_size,
            startup_timeout: Duration::from_secs(5),
            spawn_backoff: BackoffPolicy::no_retry(),
            ..HostPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn result_comes_back_and_host_is_reused() {
        let (pool, _launcher) = pool_with(config(2), Arc::default());

        let first = pool.run_task(TaskDescriptor::new("a.test")).await.unwrap();
        assert_eq!(first.test_file_path, "a.test");
        let second = pool.run_task(TaskDescriptor::new("b.test")).await.unwrap();
        assert_eq!(second.test_file_path, "b.test");

        assert_eq!(pool.size(), 1);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn reported_failure_releases_the_host() {
        let (pool, _launcher) = pool_with(config(1), Arc::default());
        let result = pool.run_task(TaskDescriptor::new("fail.test")).await.unwrap();
        assert!(result.is_failure());
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn interactive_mode_forces_a_single_host() {
        let pool_config = HostPoolConfig {
            interactive: true,
            ..config(5)
        };
        assert_eq!(pool_config.effective_max_size(), 1);
        let (pool, _launcher) = pool_with(pool_config, Arc::default());
        assert_eq!(pool.max_size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn busy_hosts_never_exceed_the_ceiling() {
        let executor = Arc::new(Echo::default());
        let (pool, _launcher) = pool_with(config(3), Arc::clone(&executor));

        let runs = (0..12).map(|i| {
            let pool = pool.clone();
            async move { pool.run_task(TaskDescriptor::new(format!("t{i}.test"))).await }
        });
        let results = join_all(runs).await;

        assert!(results.iter().all(Result::is_ok));
        assert!(executor.peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.size() <= 3);
    }

    #[tokio::test]
    async fn timed_out_host_is_discarded_and_replaced() {
        let pool_config = HostPoolConfig {
            task_timeout: Some(Duration::from_millis(100)),
            ..config(1)
        };
        let (pool, _launcher) = pool_with(pool_config, Arc::default());

        let err = pool
            .run_task(TaskDescriptor::new("hang.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert_eq!(pool.size(), 0);

        let next = pool.run_task(TaskDescriptor::new("a.test")).await.unwrap();
        assert_eq!(next.test_file_path, "a.test");
        let ids: Vec<_> = pool.entries().iter().map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn crashed_host_fails_its_task_and_the_pool_self_heals() {
        let (pool, _launcher) = pool_with(config(1), Arc::default());
        let closed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&closed);
        pool.on_close(move |event| seen.lock().unwrap().push(event));

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run_task(TaskDescriptor::new("hang.test")).await })
        };
        while pool.busy_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let crashed = pool.shared.pool.handles();
        crashed[0].kill();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::HostExited { .. }));
        assert_eq!(
            closed.lock().unwrap().as_slice(),
            &[HostClosed {
                host: EntryId::new(1),
                remaining: 0
            }]
        );

        let next = pool.run_task(TaskDescriptor::new("a.test")).await.unwrap();
        assert_eq!(next.test_file_path, "a.test");
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn kill_fails_in_flight_tasks_and_skips_on_close() {
        let (pool, _launcher) = pool_with(config(2), Arc::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        pool.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run_task(TaskDescriptor::new("hang.test")).await })
        };
        while pool.busy_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(pool.kill(), 1);
        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err, DispatchError::PoolClosed);
        assert!(pool.is_closed());
        assert_eq!(pool.flush(), 0);

        let after = pool.run_task(TaskDescriptor::new("a.test")).await.unwrap_err();
        assert_eq!(after, DispatchError::PoolClosed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn init_window_reaches_every_host() {
        let (pool, _launcher) = pool_with(config(2), Arc::default());
        let (a, b) = tokio::join!(
            pool.run_task(TaskDescriptor::new("a.test")),
            pool.run_task(TaskDescriptor::new("b.test")),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(pool.init_window().await, pool.size());
    }

    #[tokio::test]
    async fn replay_collects_recorded_tasks_from_every_host() {
        let (pool, _launcher) = pool_with(config(2), Arc::default());
        let (a, b) = tokio::join!(
            pool.run_task(TaskDescriptor::new("a.test")),
            pool.run_task(TaskDescriptor::new("fail.test")),
        );
        a.unwrap();
        b.unwrap();

        let mut paths: Vec<_> = pool
            .replay()
            .await
            .into_iter()
            .map(|r| (r.test_file_path.clone(), r.is_failure()))
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            [("a.test".to_string(), false), ("fail.test".to_string(), true)]
        );

        pool.init_window().await;
        assert!(pool.replay().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_hook_has_fired_by_the_time_a_crashed_task_fails() {
        let (pool, _launcher) = pool_with(config(1), Arc::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        pool.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for round in 0..50 {
            let running = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.run_task(TaskDescriptor::new("hang.test")).await })
            };
            while pool.busy_count() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            pool.shared.pool.handles()[0].kill();

            let err = running.await.unwrap().unwrap_err();
            assert!(matches!(err, DispatchError::HostExited { .. }));
            assert_eq!(fired.load(Ordering::SeqCst), round + 1);
            assert_eq!(pool.size(), 0);
        }
    }

    #[tokio::test]
    async fn kill_on_drop_guard() {
        let (pool, _launcher) = pool_with(config(1), Arc::default());
        pool.run_task(TaskDescriptor::new("a.test")).await.unwrap();

        pool.kill_on_drop().disarm();
        assert!(!pool.is_closed());

        {
            let _guard = pool.kill_on_drop();
        }
        assert!(pool.is_closed());
        assert_eq!(pool.size(), 0);
    }

    struct NeverReady {
        attempts: AtomicUsize,
    }

    struct Silent;

    impl HostControl for Silent {
        fn kill(&self) {}
    }

    impl HostLauncher for NeverReady {
        fn launch(&self, _id: EntryId, _env: HostEnv) -> LaunchFut<'_> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                let (ours, theirs) = tokio::io::duplex(64);
                // Keep the far end open but never answer.
                std::mem::forget(theirs);
                let (read, write) = tokio::io::split(ours);
                Ok(crate::launcher::LaunchedHost {
                    reader: Box::new(read),
                    writer: Box::new(write),
                    control: Box::new(Silent),
                })
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn host_that_never_gets_ready_exhausts_the_retries() {
        let launcher = Arc::new(NeverReady {
            attempts: AtomicUsize::new(0),
        });
        let pool = HostPool::new(
            HostPoolConfig {
                startup_timeout: Duration::from_millis(50),
                spawn_backoff: BackoffPolicy::default().with_max_attempts(3),
                ..HostPoolConfig::default()
            },
            Arc::clone(&launcher) as Arc<dyn HostLauncher>,
        );

        let err = pool.run_task(TaskDescriptor::new("a.test")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Startup { what: "host", .. }));
        assert_eq!(launcher.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 0);
    }
}
