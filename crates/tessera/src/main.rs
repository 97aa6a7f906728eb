//! Tessera - proactive token refresh and stream rewriting
//!
//! Main entry point for the tessera CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{accounts, refresh, transform};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Tessera - proactive token refresh and stream rewriting
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file (skips discovery of tessera.toml)
    #[arg(short, long, global = true, env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Keep account tokens fresh until interrupted
    Refresh(refresh::RefreshArgs),

    /// Inspect and manage stored accounts
    Accounts(accounts::AccountsArgs),

    /// Rewrite an event stream from stdin to stdout
    Transform(transform::TransformArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing: console (human-readable, stderr) + rotating JSON file
    let filter = if cli.verbose {
        "tessera=debug,tessera_oauth=debug,tessera_stream=debug,tessera_config=debug,info"
    } else {
        "tessera=info,tessera_oauth=info,tessera_stream=info,warn"
    };

    let log_dir = tessera_config::xdg_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tessera.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "tessera=trace,tessera_oauth=trace,tessera_stream=trace,tessera_config=trace,info",
                )),
        )
        .init();

    let loaded = match &cli.config {
        Some(path) => tessera_config::LoadedConfig {
            config: tessera_config::load_config_file(path)?,
            sources: vec![tessera_config::ConfigSource {
                path: path.clone(),
                loaded: true,
            }],
        },
        None => tessera_config::load_config(None)?,
    };
    for path in loaded.loaded_from() {
        tracing::debug!(path = %path.display(), "Using config");
    }

    let ctx = commands::Context {
        config: loaded,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Refresh(args) => refresh::run(args, &ctx).await,
        Commands::Accounts(args) => accounts::run(args, &ctx).await,
        Commands::Transform(args) => transform::run(args, &ctx).await,
    }
}
