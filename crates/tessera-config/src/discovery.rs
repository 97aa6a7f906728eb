//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/tessera/tessera.toml` (XDG user config)
//! 2. `./tessera.toml` (project-local)
//! 3. An explicit `--config` path replaces both

use std::path::{Path, PathBuf};

use crate::types::merge_tables;
use crate::{ConfigError, Result, TesseraConfig};

/// Config filename, both in the user config dir and project-local.
const CONFIG_FILE: &str = "tessera.toml";

/// Default accounts filename within the config directory.
const ACCOUNTS_FILE: &str = "accounts.json";

/// Application name for XDG directory resolution.
const APP_NAME: &str = "tessera";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "TESSERA_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: TesseraConfig,
    /// Sources checked, lowest precedence first.
    pub sources: Vec<ConfigSource>,
}

impl LoadedConfig {
    /// Paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }

    /// Accounts file: the configured path, else `accounts.json` in the
    /// config directory.
    pub fn accounts_path(&self) -> Option<PathBuf> {
        self.config
            .accounts_path
            .clone()
            .or_else(|| xdg_config_dir().map(|d| d.join(ACCOUNTS_FILE)))
    }
}

/// Load configuration by discovering and merging the user and project layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with an explicit user config directory.
///
/// `config_dir` overrides both `TESSERA_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut merged = toml::Table::new();
    let mut sources = Vec::new();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(CONFIG_FILE)),
        None => xdg_config_path(),
    };
    if let Some(path) = user_path {
        sources.push(load_layer(&mut merged, &path)?);
    }

    let project_path = project_dir
        .map(|d| d.join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    sources.push(load_layer(&mut merged, &project_path)?);

    let config: TesseraConfig = toml::Value::Table(merged).try_into()?;
    config.validate()?;

    Ok(LoadedConfig { config, sources })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<TesseraConfig> {
    let contents = read_file(path)?;
    let config = TesseraConfig::from_toml(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to a file, creating parent directories.
pub fn save_config(config: &TesseraConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Path of the user config file.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(CONFIG_FILE))
}

/// The tessera config directory.
///
/// Checks `TESSERA_CONFIG_DIR` first, then falls back to the platform default.
pub fn xdg_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Merge a config file into `merged` if it exists.
///
/// A file that exists but does not parse is an error, not a skipped layer.
fn load_layer(merged: &mut toml::Table, path: &Path) -> Result<ConfigSource> {
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "Config layer not found");
        return Ok(ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        });
    }

    let layer: toml::Table = toml::from_str(&read_file(path)?)?;
    merge_tables(merged, layer);
    tracing::debug!(path = %path.display(), "Loaded config layer");

    Ok(ConfigSource {
        path: path.to_path_buf(),
        loaded: true,
    })
}
