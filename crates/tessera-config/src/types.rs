//! Configuration types for `tessera.toml`.
//!
//! Each section deserializes straight into the runtime config of the crate
//! that owns it, so defaults live in one place.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tessera_oauth::{OAuthConfig, ProactiveRefreshConfig, RetryPolicy};
use tessera_stream::{SignatureStoreConfig, TransformerConfig};

use crate::error::{ConfigError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Accounts file. Defaults to `accounts.json` in the config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts_path: Option<PathBuf>,
    /// Proactive refresh scheduling.
    pub refresh: ProactiveRefreshConfig,
    /// Token endpoint client.
    pub oauth: OAuthConfig,
    /// Backoff for token endpoint calls.
    pub retry: RetryPolicy,
    /// Stream transformer settings.
    pub stream: TransformerConfig,
    /// Signature cache bounds.
    pub signatures: SignatureStoreConfig,
}

impl TesseraConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.refresh.check_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "refresh.check_interval_seconds".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.max_delay_ms".to_string(),
                reason: format!(
                    "{} is below initial_delay_ms ({})",
                    self.retry.max_delay_ms, self.retry.initial_delay_ms
                ),
            });
        }
        if self.oauth.token_url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "oauth.token_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Recursively merge `overlay` into `base`. Tables merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub(crate) fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
