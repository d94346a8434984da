//! Command-line surface of the `fleet` binary.

use std::path::Path;

use clap::Parser;
use clap::builder::RangedU64ValueParser;
use serde_json::json;

use fleet_config::{EnvOverrides, PoolSettings};
use fleet_types::TaskDescriptor;

#[derive(Debug, Clone, Default, PartialEq, Eq, Parser)]
#[command(name = "fleet")]
#[command(about = "Run test files across a pool of host processes.", long_about = None)]
pub struct Args {
    /// Share the machine: use half the workers
    #[arg(long)]
    pub watch: bool,

    /// One visible host; stays up after the run
    #[arg(long)]
    pub interactive: bool,

    /// Upper bound on concurrent hosts
    #[arg(long, value_name = "N", value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_workers: Option<usize>,

    /// Test files to run, relative to the working directory
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<String>,
}

impl Args {
    /// Flags win over the environment; a flag that is off leaves the
    /// environment's value alone.
    #[must_use]
    pub fn overrides(&self, env: EnvOverrides) -> EnvOverrides {
        EnvOverrides {
            interactive: self.interactive || env.interactive,
            watch: self.watch || env.watch,
            max_workers: self.max_workers.or(env.max_workers),
        }
    }

    /// One descriptor per path, sharing the run-wide config.
    #[must_use]
    pub fn tasks(&self, root: &Path, settings: &PoolSettings) -> Vec<TaskDescriptor> {
        let config = json!({ "rootDir": root.display().to_string() });
        let global_config = json!({
            "watch": settings.watch,
            "maxWorkers": settings.max_workers,
            "interactive": settings.interactive,
        });
        self.paths
            .iter()
            .map(|path| {
                let absolute = root.join(path);
                TaskDescriptor::new(absolute.display().to_string())
                    .with_config(config.clone())
                    .with_global_config(global_config.clone())
            })
            .collect()
    }
}
