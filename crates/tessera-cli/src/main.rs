//! Operator CLI for Tessera
//!
//! Inspects exported ledger and sealed-secrets files and runs in-process
//! crash/recover simulations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tessera_core::RecoveryConfig;

mod commands;

use commands::{inspect, simulate};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera - replicated ledger recovery tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an exported ledger file and summarize its contents
    InspectLedger {
        /// Ledger file written by a crashed service
        file: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the generations in a sealed secrets file
    InspectSecrets {
        /// Secrets file written by a crashed service
        file: PathBuf,
    },

    /// Run repeated crash/recover cycles in process
    Simulate(simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::InspectLedger { file, json } => {
            inspect::inspect_ledger(&file, json)?;
        }

        Commands::InspectSecrets { file } => {
            inspect::inspect_secrets(&file)?;
        }

        Commands::Simulate(args) => {
            let config = load_config(cli.config.as_deref())?;
            simulate::run(args, config).await?;
        }
    }

    Ok(())
}

/// Defaults, then the optional TOML file, then `TESSERA_*` overrides.
fn load_config(path: Option<&Path>) -> Result<RecoveryConfig> {
    let mut config = match path {
        Some(path) => RecoveryConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RecoveryConfig::default(),
    };
    config.merge_with_env()?;
    config.validate()?;
    tracing::debug!(?config, "configuration loaded");
    Ok(config)
}
