//! Configuration for tessera.
//!
//! A single `tessera.toml` whose sections map onto the runtime configs of
//! the refresh and stream crates:
//! - `[refresh]`, `[oauth]`, `[retry]` for proactive token refresh
//! - `[stream]`, `[signatures]` for the stream transformer
//! - `accounts_path` for the accounts file
//!
//! Files are layered (XDG user config, then project-local) and merged key by key.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::TesseraConfig;
