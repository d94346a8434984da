//! Host pool and runner over real `fleet-host` processes.

use std::time::Duration;

use fleet_engine::{Runner, RunnerConfig, TaskFailure};
use fleet_host::HostPool;
use fleet_types::DispatchError;
use fleet_utils::BackoffPolicy;

use crate::common::{Fixture, Recorder, pool_config};

#[tokio::test]
async fn hosts_run_tasks_and_report_failures() {
    let fixture = Fixture::new();
    let pool = HostPool::new(pool_config(2), fixture.launcher());

    let (passed, failed) = tokio::join!(
        pool.run_task(fixture.task("a.test")),
        pool.run_task(fixture.task("fail.test")),
    );

    let passed = passed.unwrap();
    assert!(!passed.is_failure());
    assert!(passed.console_text().contains("ran a.test"));

    let failed = failed.unwrap();
    assert!(failed.is_failure());
    assert!(
        failed
            .failure_message
            .unwrap()
            .contains("assertion failed in fail.test")
    );

    let pids = pool.pids();
    assert!(!pids.is_empty() && pids.len() <= 2);
    assert_eq!(pool.kill(), pids.len());
    assert!(pool.is_closed());
}

#[tokio::test]
async fn crashed_host_fails_its_task_and_is_replaced() {
    let fixture = Fixture::new();
    let pool = HostPool::new(pool_config(1), fixture.launcher());

    pool.run_task(fixture.task("a.test")).await.unwrap();
    let first = pool.pids();

    let err = pool.run_task(fixture.task("crash.test")).await.unwrap_err();
    assert!(matches!(err, DispatchError::HostExited { .. }), "{err}");

    pool.run_task(fixture.task("b.test")).await.unwrap();
    let second = pool.pids();
    assert_eq!(second.len(), 1);
    assert_ne!(first, second);

    pool.kill();
}

#[tokio::test]
async fn init_window_round_trips_through_a_real_host() {
    let fixture = Fixture::new();
    let pool = HostPool::new(pool_config(1), fixture.launcher());
    pool.run_task(fixture.task("a.test")).await.unwrap();

    assert_eq!(pool.init_window().await, 1);
    pool.kill();
}

#[tokio::test]
async fn runner_routes_every_task_and_leaves_no_hosts() {
    let fixture = Fixture::new();
    let observer = Recorder::default();
    let config = RunnerConfig {
        max_workers: 2,
        watch: false,
        interactive: false,
        contexts_per_host: 1,
        task_timeout: Some(Duration::from_secs(30)),
        startup_timeout: Duration::from_secs(30),
        spawn_backoff: BackoffPolicy::no_retry(),
    };
    let runner = Runner::new(config, fixture.launcher());

    let tasks = ["a.test", "b.test", "fail.test", "slow.test"]
        .map(|name| fixture.task(name))
        .to_vec();
    let report = runner.run_tasks(tasks, &observer).await;

    assert_eq!(report.summary.passed, 3);
    assert_eq!(report.summary.failed, 1);
    assert!(report.session.is_none());
    assert_eq!(observer.started.lock().unwrap().len(), 4);

    let failed = observer.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].0.ends_with("fail.test"));
    assert!(matches!(failed[0].1, TaskFailure::Reported { .. }));
}
