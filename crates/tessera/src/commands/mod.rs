//! CLI command handlers.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tessera_config::LoadedConfig;

pub mod accounts;
pub mod refresh;
pub mod transform;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration and where it came from.
    pub config: LoadedConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Accounts file: the command-line override, else the configured default.
    pub fn accounts_path(&self, overridden: Option<&Path>) -> Result<PathBuf> {
        overridden
            .map(Path::to_path_buf)
            .or_else(|| self.config.accounts_path())
            .ok_or_else(|| {
                anyhow!("No accounts file: pass --accounts or set accounts_path in tessera.toml")
            })
    }
}
