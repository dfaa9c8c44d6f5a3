use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use poolmgr::{cli, config};

#[derive(Parser)]
#[command(name = "poolmgr")]
#[command(version, about = "Connection pool manager with circuit breaking and load balancing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to POOLMGR_* environment variables)
    #[arg(long, global = true, env = "POOLMGR_CONFIG")]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep all configured pools running until Ctrl-C
    Run {
        /// Seconds between stats lines
        #[arg(long, default_value = "10")]
        interval_secs: u64,
    },

    /// Print a JSON stats snapshot of every pool and exit
    Stats,

    /// Validate the configuration and list its pools
    Validate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run { interval_secs } => {
            config.validate()?;
            cli::cmd_run(config, Duration::from_secs(interval_secs.max(1))).await?;
        }
        Commands::Stats => {
            config.validate()?;
            cli::cmd_stats(config).await?;
        }
        Commands::Validate => {
            cli::cmd_validate(&config)?;
        }
    }

    Ok(())
}
