//! `fleet-host`: one host process.
//!
//! Spawned by the dispatcher with `FLEET_INTERACTIVE` and
//! `FLEET_CONTEXT_CONCURRENCY` set. Speaks the framed protocol on stdin and
//! stdout and exits when stdin closes.

use std::sync::Arc;

use anyhow::{Context, Result};

use fleet_cli::logging;
use fleet_config::{EnvOverrides, FleetConfig};
use fleet_context::{CommandExecutor, ContextPool, ContextPoolConfig};
use fleet_types::HostEnv;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_host();

    let host_env = HostEnv::from_lookup(|key| std::env::var(key).ok());
    let config = match FleetConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("{e}; using defaults");
            FleetConfig::default()
        }
    };
    let settings = config.pool_settings(&EnvOverrides::default());
    let executor = CommandExecutor::new(config.executor_settings());
    tracing::debug!(
        interactive = host_env.interactive,
        contexts = host_env.context_concurrency,
        command = %executor.settings().command,
        "Host starting"
    );

    let contexts = ContextPool::new(
        ContextPoolConfig {
            task_timeout: settings.task_timeout,
            startup_timeout: settings.startup_timeout,
            display: Some(Arc::new(config.display_store())),
            ..ContextPoolConfig::for_host(host_env)
        },
        Arc::new(executor),
    );

    fleet_host::serve(tokio::io::stdin(), tokio::io::stdout(), contexts)
        .await
        .context("serving the dispatcher")
}
