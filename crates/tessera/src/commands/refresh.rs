//! Refresh command - run the proactive refresh queue until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use tessera_config::TesseraConfig;
use tessera_oauth::{
    AccountManager, FileAccountStore, InMemoryRefreshCache, ProactiveRefreshQueue,
    RefreshQueueStats, TokenRefresher,
};

use super::Context;

/// Arguments for the refresh command.
#[derive(Args, Debug)]
pub struct RefreshArgs {
    /// Accounts file (overrides accounts_path from config)
    #[arg(long)]
    pub accounts: Option<PathBuf>,

    /// Refresh this many seconds before expiry
    #[arg(long)]
    pub buffer_seconds: Option<u64>,

    /// Seconds between scans
    #[arg(long)]
    pub interval: Option<u64>,
}

/// Run the refresh command.
pub async fn run(args: RefreshArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config.config;
    let path = ctx.accounts_path(args.accounts.as_deref())?;

    let mut refresh_config = config.refresh.clone().with_enabled(true);
    if let Some(secs) = args.buffer_seconds {
        refresh_config = refresh_config.with_buffer_seconds(secs);
    }
    if let Some(secs) = args.interval {
        refresh_config = refresh_config.with_check_interval_seconds(secs.max(1));
    }

    let effective = TesseraConfig {
        refresh: refresh_config.clone(),
        ..config.clone()
    };
    effective.validate()?;

    let store = Arc::new(FileAccountStore::open(&path).await?);
    if store.accounts().is_empty() {
        tracing::warn!(path = %path.display(), "No accounts to refresh");
    }

    let refresher = TokenRefresher::new(config.oauth.clone())
        .with_retry_policy(config.retry.clone())
        .with_cache(Arc::new(InMemoryRefreshCache::new()));

    let queue = ProactiveRefreshQueue::new(refresh_config, store.clone(), Arc::new(refresher));

    tracing::info!(
        accounts = store.accounts().len(),
        path = %path.display(),
        "Starting proactive refresh; press Ctrl-C to stop"
    );
    queue.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, stopping refresh queue");
    queue.shutdown().await;

    print_stats(&queue.stats(), ctx)
}

fn print_stats(stats: &RefreshQueueStats, ctx: &Context) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    let errors = if stats.error_count > 0 {
        Style::new().red()
    } else {
        Style::new().green()
    };

    println!();
    println!("{}", style("Refresh Summary").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!("  {} {}", dim.apply_to("Refreshed:"), stats.refresh_count);
    println!(
        "  {} {}",
        dim.apply_to("Errors:"),
        errors.apply_to(stats.error_count)
    );
    if let Some(at) = stats.last_refresh_time {
        println!("  {} {}", dim.apply_to("Last refresh:"), format_millis(at));
    }
    if let Some(at) = stats.last_check_time {
        println!("  {} {}", dim.apply_to("Last check:"), format_millis(at));
    }
    println!();
    Ok(())
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}
