//! CLI entry point for the stain master.
//!
//! Loads configuration, initializes tracing, builds the [`Master`] context
//! and runs it until interrupted.
//!
//! # Usage
//!
//! ```bash
//! stain-master --config config/master.toml
//! stain-master --config config/master.toml --log-format json
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use stain_master::config::MasterConfig;
use stain_master::tracing_setup::{self, OutputFormat};
use stain_master::Master;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "stain-master")]
#[command(about = "Supervisory master process for the staining instrument", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/master.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MasterConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config
        .validate()
        .map_err(|reason| anyhow!("invalid configuration: {reason}"))?;

    tracing_setup::init_from_config(&config, cli.log_format).map_err(|e| anyhow!(e))?;
    info!(
        instrument = %config.application.name,
        processes = config.processes.len(),
        "stain master starting"
    );

    let mut master = Master::new(config)?;
    master.run().await?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown signal received");
    master.shutdown().await;

    Ok(())
}
