mod cache;
mod extract;
mod health;

use biofetch_core::{ConfigError, ExtractionConfig};
use serde_json::Value;

use crate::cli::{CacheCommand, Cli, Command};
use crate::error::CliError;

pub struct CommandResult {
    pub data: Value,
    /// The command finished but not everything succeeded (exit code 3).
    pub degraded: bool,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            degraded: false,
        }
    }

    pub fn with_degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    let config = load_config(cli)?;

    match &cli.command {
        Command::Extract(args) => extract::run(args, config).await,
        Command::Cache(args) => match &args.command {
            CacheCommand::Clear => cache::clear(&config),
        },
        Command::Health(args) => health::run(args, &config).await,
    }
}

fn load_config(cli: &Cli) -> Result<ExtractionConfig, CliError> {
    let path = cli.config.as_deref().ok_or(ConfigError::Missing("--config"))?;
    let config = ExtractionConfig::from_path(path)?;
    tracing::debug!(path = %path.display(), source = %config.source, "loaded config");
    Ok(config)
}
