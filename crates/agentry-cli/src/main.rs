//! Agentry CLI entry point.
//!
//! Binary name: `agentry`
//!
//! Parses CLI arguments, installs tracing, loads the runtime config and
//! dispatches to the command handler.

mod agents;
mod cli;
mod config;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _tracing = agentry_observe::init_tracing(&cli.tracing_options())
        .context("failed to initialize tracing")?;

    dispatch(&cli).await
}

async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let config_path = config::resolve_config_path(cli.config.as_deref());
    let runtime_config = config::load_runtime_config(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    match cli.command {
        Commands::Run { duration } => {
            cli::run::run(
                runtime_config,
                &config_path,
                duration.map(Duration::from_secs),
                cli.json,
                cli.quiet,
            )
            .await?;
        }

        Commands::Validate => {
            cli::validate::validate(&runtime_config, &config_path, cli.json)?;
        }
    }

    Ok(())
}
