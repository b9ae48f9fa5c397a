//! sashi-agentd - node-local agent managing Hot Pocket contract instances
//!
//! Owns containers, Linux users, port allocation, instance keys, and the
//! control surfaces (local Unix socket, optional remote session) that
//! drive their lifecycle.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "sashi-agentd")]
#[command(about = "Node-local agent managing Hot Pocket contract instances")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "sa.cfg")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sashi_agentd={}", log_level).into()),
        )
        .init();

    info!("Starting sashi-agentd v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run().await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("agent error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
