//! `fleet`: run test files across a pool of `fleet-host` processes.
//!
//! ```text
//! main() -> Runner::run_tasks() -> HostPool -> fleet-host (stdin/stdout)
//!                                                 |
//!                                                 v
//!                                    ContextPool -> CommandExecutor
//! ```
//!
//! Hosts are killed when the run ends, on Ctrl-C, and if `main` unwinds.
//! With `--interactive` the single host stays up until it exits or Ctrl-C;
//! each line on stdin replays the tasks it ran last.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use fleet_cli::{Args, ConsoleReporter, logging};
use fleet_config::{EnvOverrides, FleetConfig};
use fleet_engine::{Runner, RunnerConfig};
use fleet_host::ProcessLauncher;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Usage errors exit with status 2 before anything is started.
    let args = Args::parse();
    logging::init_dispatcher();

    let config = match FleetConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("warning: {e}; using defaults");
            FleetConfig::default()
        }
    };
    let settings = config.pool_settings(&args.overrides(EnvOverrides::from_env()));
    let root = env::current_dir().context("reading the working directory")?;
    let tasks = args.tasks(&root, &settings);

    let host = config.host_settings();
    let launcher = match host.program {
        Some(program) => ProcessLauncher::new(program),
        None => ProcessLauncher::locate().context("locating the host binary")?,
    };
    let launcher = host
        .args
        .into_iter()
        .fold(launcher, |launcher, arg| launcher.arg(arg));
    let launcher = host
        .env
        .into_iter()
        .fold(launcher, |launcher, (key, value)| launcher.env(key, value));
    tracing::info!(host = %launcher.program().display(), "Using host binary");
    let runner = Runner::new(RunnerConfig::from_settings(&settings), Arc::new(launcher));
    let reporter = ConsoleReporter::stdout();

    // Dropping the run on Ctrl-C kills its hosts.
    let report = tokio::select! {
        report = runner.run_tasks(tasks, &reporter) => report,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted; hosts killed");
            eprintln!("Interrupted");
            return Ok(ExitCode::from(130));
        }
    };
    reporter.summary(&report.summary);

    let mut last = report.summary;
    if let Some(mut session) = report.session {
        eprintln!("Interactive host running. Press Enter to re-run, Ctrl-C to exit.");
        let mut input = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        loop {
            tokio::select! {
                () = session.closed() => {
                    tracing::info!("Interactive host closed");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted; ending interactive session");
                    break;
                }
                line = input.next_line(), if stdin_open => match line {
                    Ok(Some(_)) => tokio::select! {
                        summary = session.replay(&reporter) => {
                            reporter.summary(&summary);
                            last = summary;
                        }
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("Interrupted during replay; ending interactive session");
                            break;
                        }
                    },
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::warn!("Stopped reading stdin: {e}");
                        stdin_open = false;
                    }
                },
            }
        }
        session.kill();
    }

    // The exit status follows the most recent run or replay.
    Ok(if last.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
