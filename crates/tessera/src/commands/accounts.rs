//! Accounts command - list stored accounts and their token lifetimes.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use console::{Style, style};
use tessera_oauth::credentials::now_millis;
use tessera_oauth::{AccountManager, AccountStatus, FileAccountStore, ManagedAccount};

use super::Context;

/// Arguments for the accounts command.
#[derive(Args, Debug)]
pub struct AccountsArgs {
    /// Accounts file (overrides accounts_path from config)
    #[arg(long, global = true)]
    pub accounts: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<AccountsCommand>,
}

#[derive(Subcommand, Debug)]
pub enum AccountsCommand {
    /// List accounts with expiry status (default)
    List,

    /// Add an account from its refresh credential
    Add {
        /// Refresh blob: `refreshToken|projectId|managedProjectId`
        refresh: String,

        /// Email shown in listings
        #[arg(long)]
        email: Option<String>,
    },
}

/// Run the accounts command.
pub async fn run(args: AccountsArgs, ctx: &Context) -> Result<()> {
    let path = ctx.accounts_path(args.accounts.as_deref())?;
    let store = FileAccountStore::open(&path).await?;

    match args.command.unwrap_or(AccountsCommand::List) {
        AccountsCommand::List => list(&store, ctx),
        AccountsCommand::Add { refresh, email } => add(&store, refresh, email, ctx).await,
    }
}

fn list(store: &FileAccountStore, ctx: &Context) -> Result<()> {
    let buffer_ms = (ctx.config.config.refresh.buffer_seconds as i64).saturating_mul(1000);
    let now = now_millis();
    let statuses: Vec<AccountStatus> = store
        .accounts()
        .iter()
        .map(|account| AccountStatus::from_account(account, now, buffer_ms))
        .collect();

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    let dim = Style::new().dim();

    println!();
    println!("{}", style("Accounts").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();

    if statuses.is_empty() {
        println!("  {}", dim.apply_to("No accounts configured"));
        println!(
            "  {}",
            dim.apply_to("Add one with: tessera accounts add <refresh>")
        );
        println!();
        return Ok(());
    }

    for status in &statuses {
        let expiry = status.expires_in_display();
        let expiry = if status.is_expired {
            Style::new().red().apply_to(expiry)
        } else if status.needs_refresh {
            Style::new().yellow().apply_to(expiry)
        } else {
            Style::new().green().apply_to(expiry)
        };
        println!(
            "  {:>3}  {:<32} {}",
            status.index,
            status.email.as_deref().unwrap_or("-"),
            expiry
        );
    }

    if ctx.verbose {
        println!();
        println!("  {} {}", dim.apply_to("File:"), store.path().display());
    }
    println!();
    Ok(())
}

async fn add(
    store: &FileAccountStore,
    refresh: String,
    email: Option<String>,
    ctx: &Context,
) -> Result<()> {
    if tessera_oauth::parse_refresh_parts(&refresh)
        .refresh_token
        .is_none()
    {
        bail!("Refresh credential has no refresh token");
    }

    let mut account = ManagedAccount::new(0, refresh);
    if let Some(email) = email {
        account = account.with_email(email);
    }
    let index = store.add(account);
    store.save_to_disk().await?;

    if ctx.json_output {
        println!("{}", serde_json::json!({ "index": index }));
    } else {
        println!(
            "{} Added account #{} to {}",
            Style::new().green().apply_to("✓"),
            index,
            store.path().display()
        );
    }
    Ok(())
}
