//! Run orchestration: concurrency sizing, batch runs and interactive sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;

use fleet_config::PoolSettings;
use fleet_host::{HostLauncher, HostPool, HostPoolConfig};
use fleet_types::{DispatchError, TaskDescriptor, TaskResult};
use fleet_utils::BackoffPolicy;

use crate::observer::{RunObserver, RunSummary, TaskFailure};

/// How many tasks a run keeps in flight.
///
/// `min(task_count, max_parallelism)`, halved (rounding up) in watch mode so
/// an editor sharing the machine keeps some headroom. Never 0 when there is
/// work to do.
#[must_use]
pub fn get_concurrency(task_count: usize, max_parallelism: usize, watch: bool) -> usize {
    let concurrency = task_count.min(max_parallelism.max(1));
    if watch {
        concurrency.div_ceil(2)
    } else {
        concurrency
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_workers: usize,
    pub watch: bool,
    pub interactive: bool,
    pub contexts_per_host: usize,
    pub task_timeout: Option<Duration>,
    pub startup_timeout: Duration,
    pub spawn_backoff: BackoffPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default())
    }
}

impl RunnerConfig {
    #[must_use]
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            max_workers: settings.max_workers,
            watch: settings.watch,
            interactive: settings.interactive,
            contexts_per_host: settings.contexts_per_host,
            task_timeout: settings.task_timeout,
            startup_timeout: settings.startup_timeout,
            spawn_backoff: BackoffPolicy::default().with_max_attempts(settings.spawn_attempts),
        }
    }

    fn host_pool(&self, concurrency: usize) -> HostPoolConfig {
        HostPoolConfig {
            max_size: concurrency,
            interactive: self.interactive,
            contexts_per_host: self.contexts_per_host,
            task_timeout: self.task_timeout,
            startup_timeout: self.startup_timeout,
            spawn_backoff: self.spawn_backoff,
        }
    }
}

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Interactive runs keep their host alive here.
    pub session: Option<InteractiveSession>,
}

/// Routes tasks through a fresh [`HostPool`] per run.
pub struct Runner {
    config: RunnerConfig,
    launcher: Arc<dyn HostLauncher>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runner {
    #[must_use]
    pub fn new(config: RunnerConfig, launcher: Arc<dyn HostLauncher>) -> Self {
        Self { config, launcher }
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run every task, at most [`get_concurrency`] at a time.
    ///
    /// A slot opens as soon as any task settles. Outside interactive mode the
    /// pool is killed before this returns; dropping the future mid-run kills
    /// it too.
    pub async fn run_tasks(
        &self,
        tasks: Vec<TaskDescriptor>,
        observer: &dyn RunObserver,
    ) -> RunReport {
        let config = &self.config;
        let concurrency = get_concurrency(tasks.len(), config.max_workers, config.watch);
        if concurrency == 0 {
            return RunReport {
                summary: RunSummary::default(),
                session: None,
            };
        }

        let pool = HostPool::new(config.host_pool(concurrency), Arc::clone(&self.launcher));
        let guard = pool.kill_on_drop();
        let session = config
            .interactive
            .then(|| InteractiveSession::wire(&pool, concurrency));
        tracing::info!(
            tasks = tasks.len(),
            concurrency,
            hosts = pool.max_size(),
            watch = config.watch,
            interactive = config.interactive,
            "Starting run"
        );

        let summary = dispatch_all(&pool, tasks, concurrency, observer).await;
        tracing::info!(%summary, "Run finished");

        if session.is_some() {
            guard.disarm();
        } else {
            drop(guard);
        }
        RunReport { summary, session }
    }
}

/// A live interactive pool after its first run.
#[derive(Debug)]
pub struct InteractiveSession {
    pool: HostPool,
    concurrency: usize,
    closed: watch::Receiver<bool>,
}

impl InteractiveSession {
    fn wire(pool: &HostPool, concurrency: usize) -> Self {
        let (tx, closed) = watch::channel(false);
        pool.on_close(move |event| {
            if event.remaining == 0 {
                tracing::info!(host = %event.host, "Last host closed; ending interactive session");
                let _ = tx.send(true);
            }
        });
        Self {
            pool: pool.clone(),
            concurrency,
            closed,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &HostPool {
        &self.pool
    }

    /// Resolves once the last host has exited on its own.
    pub async fn closed(&mut self) {
        if self.pool.size() == 0 {
            return;
        }
        let _ = self.closed.wait_for(|closed| *closed).await;
    }

    /// Run again on the same hosts, after resetting their windows.
    pub async fn run_tasks(
        &self,
        tasks: Vec<TaskDescriptor>,
        observer: &dyn RunObserver,
    ) -> RunSummary {
        let reset = self.pool.init_window().await;
        tracing::debug!(hosts = reset, "Windows reset for rerun");
        let concurrency = tasks.len().min(self.concurrency);
        if concurrency == 0 {
            return RunSummary::default();
        }
        dispatch_all(&self.pool, tasks, concurrency, observer).await
    }

    /// Rerun whatever the hosts recorded since the last
    /// [`run_tasks`](Self::run_tasks), without resetting them first.
    ///
    /// Results settle per host in recording order.
    pub async fn replay(&self, observer: &dyn RunObserver) -> RunSummary {
        let results = self.pool.replay().await;
        tracing::debug!(results = results.len(), "Replay finished");

        let mut summary = RunSummary::default();
        for result in results {
            let task = TaskDescriptor::new(result.test_file_path.clone());
            observer.on_start(&task);
            match report(observer, &task, result) {
                Settled::Passed => summary.passed += 1,
                Settled::Failed | Settled::NotRun => summary.failed += 1,
            }
        }
        summary
    }

    pub fn kill(self) {
        self.pool.kill();
    }
}

/// Route one report to the observer.
fn report(observer: &dyn RunObserver, task: &TaskDescriptor, result: TaskResult) -> Settled {
    match result.failure_message.clone() {
        Some(message) => {
            observer.on_failure(task, &TaskFailure::Reported { message, result });
            Settled::Failed
        }
        None => {
            observer.on_result(task, &result);
            Settled::Passed
        }
    }
}

enum Settled {
    Passed,
    Failed,
    NotRun,
}

struct Dispatch<'a> {
    pool: &'a HostPool,
    observer: &'a dyn RunObserver,
    host_seen: AtomicBool,
    /// Set once a host failed to start and none ever had.
    fatal: Mutex<Option<DispatchError>>,
}

async fn dispatch_all(
    pool: &HostPool,
    tasks: Vec<TaskDescriptor>,
    concurrency: usize,
    observer: &dyn RunObserver,
) -> RunSummary {
    let dispatch = Dispatch {
        pool,
        observer,
        host_seen: AtomicBool::new(false),
        fatal: Mutex::new(None),
    };

    let mut settled = stream::iter(tasks)
        .map(|task| dispatch.run(task))
        .buffer_unordered(concurrency);

    let mut summary = RunSummary::default();
    while let Some(outcome) = settled.next().await {
        match outcome {
            Settled::Passed => summary.passed += 1,
            Settled::Failed => summary.failed += 1,
            Settled::NotRun => summary.dispatch_errors += 1,
        }
    }
    drop(settled);
    summary.aborted = dispatch.fatal().is_some();
    summary
}

impl Dispatch<'_> {
    fn fatal(&self) -> Option<DispatchError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run(&self, task: TaskDescriptor) -> Settled {
        self.observer.on_start(&task);

        if let Some(err) = self.fatal() {
            self.observer.on_failure(&task, &TaskFailure::Dispatch(err));
            return Settled::NotRun;
        }

        match self.pool.run_task(task.clone()).await {
            Ok(result) => {
                self.host_seen.store(true, Ordering::Release);
                report(self.observer, &task, result)
            }
            Err(err) => {
                if matches!(err, DispatchError::Startup { .. }) {
                    if !self.host_seen.load(Ordering::Acquire) {
                        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
                        if fatal.is_none() {
                            tracing::error!("No host could be started, failing the rest of the run: {err}");
                            *fatal = Some(err.clone());
                        }
                    }
                } else {
                    self.host_seen.store(true, Ordering::Release);
                }
                tracing::warn!(path = %task.path, "Task not run: {err}");
                self.observer.on_failure(&task, &TaskFailure::Dispatch(err));
                Settled::NotRun
            }
        }
    }
}
