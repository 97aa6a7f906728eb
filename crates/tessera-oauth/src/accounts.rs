//! Managed accounts and the account store collaborator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::credentials::OAuthAuthDetails;
use crate::error::{OAuthError, Result};

/// Current accounts file format version.
pub const ACCOUNTS_FILE_VERSION: u32 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// ManagedAccount
// ─────────────────────────────────────────────────────────────────────────────

/// An account whose credential is kept fresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedAccount {
    /// Position in the account store.
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub email: Option<String>,
    /// Serialized refresh blob.
    pub refresh: String,
    #[serde(default)]
    pub access: Option<String>,
    /// Access token expiry in epoch milliseconds. Absent means unknown.
    #[serde(default)]
    pub expires: Option<i64>,
}

impl ManagedAccount {
    pub fn new(index: usize, refresh: impl Into<String>) -> Self {
        Self {
            index,
            email: None,
            refresh: refresh.into(),
            access: None,
            expires: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_expires(mut self, expires: i64) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_access(mut self, access: impl Into<String>) -> Self {
        self.access = Some(access.into());
        self
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match &self.email {
            Some(email) => format!("#{} ({})", self.index, email),
            None => format!("#{}", self.index),
        }
    }

    fn apply(&mut self, details: &OAuthAuthDetails) {
        self.access = Some(details.access.clone());
        self.expires = Some(details.expires);
        self.refresh = details.refresh.clone();
    }
}

/// True when `expires` is known and falls within `buffer_ms` of `now_ms`.
pub fn needs_refresh_at(account: &ManagedAccount, now_ms: i64, buffer_ms: i64) -> bool {
    match account.expires {
        Some(expires) => now_ms.saturating_add(buffer_ms) >= expires,
        None => false,
    }
}

/// True when `expires` is known and already passed.
pub fn is_expired_at(account: &ManagedAccount, now_ms: i64) -> bool {
    match account.expires {
        Some(expires) => now_ms >= expires,
        None => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AccountManager Trait
// ─────────────────────────────────────────────────────────────────────────────

/// The store that owns managed accounts.
#[async_trait]
pub trait AccountManager: Send + Sync + std::fmt::Debug {
    /// Snapshot of all managed accounts.
    fn accounts(&self) -> Vec<ManagedAccount>;

    /// Current auth details for an account.
    fn to_auth_details(&self, account: &ManagedAccount) -> OAuthAuthDetails {
        OAuthAuthDetails {
            access: account.access.clone().unwrap_or_default(),
            expires: account.expires.unwrap_or(0),
            refresh: account.refresh.clone(),
        }
    }

    /// Apply refreshed credentials in memory.
    fn update_from_auth(&self, account: &ManagedAccount, details: &OAuthAuthDetails);

    /// Persist all accounts to durable storage.
    async fn save_to_disk(&self) -> Result<()>;
}

/// Shared account store handle.
pub type SharedAccountManager = Arc<dyn AccountManager>;

// ─────────────────────────────────────────────────────────────────────────────
// FileAccountStore
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    accounts: Vec<ManagedAccount>,
}

/// JSON-file account store.
#[derive(Debug)]
pub struct FileAccountStore {
    path: PathBuf,
    accounts: RwLock<Vec<ManagedAccount>>,
}

impl FileAccountStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let accounts = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let file: AccountsFile = serde_json::from_str(&content).map_err(|e| {
                    OAuthError::Serialization(format!(
                        "Failed to parse accounts file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                file.accounts
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(OAuthError::Storage(format!(
                    "Failed to read accounts file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let accounts = accounts
            .into_iter()
            .enumerate()
            .map(|(index, account)| ManagedAccount { index, ..account })
            .collect::<Vec<_>>();

        tracing::debug!(path = %path.display(), count = accounts.len(), "Loaded accounts");

        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an account, assigning its index.
    pub fn add(&self, account: ManagedAccount) -> usize {
        let mut accounts = self.accounts.write();
        let index = accounts.len();
        accounts.push(ManagedAccount { index, ..account });
        index
    }
}

#[async_trait]
impl AccountManager for FileAccountStore {
    fn accounts(&self) -> Vec<ManagedAccount> {
        self.accounts.read().clone()
    }

    fn update_from_auth(&self, account: &ManagedAccount, details: &OAuthAuthDetails) {
        if let Some(stored) = self.accounts.write().get_mut(account.index) {
            stored.apply(details);
        }
    }

    async fn save_to_disk(&self) -> Result<()> {
        let file = AccountsFile {
            version: ACCOUNTS_FILE_VERSION,
            accounts: self.accounts(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| OAuthError::Serialization(format!("Failed to serialize accounts: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OAuthError::Storage(format!("Failed to create accounts directory: {}", e))
            })?;
        }

        // Write to a sibling file first so readers never see a partial file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| OAuthError::Storage(format!("Failed to write accounts file: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| OAuthError::Storage(format!("Failed to replace accounts file: {}", e)))?;

        tracing::debug!(path = %self.path.display(), "Accounts saved");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryAccountManager (for testing)
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory account store for testing.
#[derive(Debug, Default)]
pub struct InMemoryAccountManager {
    accounts: RwLock<Vec<ManagedAccount>>,
    save_count: AtomicU32,
    fail_saves: AtomicBool,
}

impl InMemoryAccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: Vec<ManagedAccount>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
            ..Default::default()
        }
    }

    /// Make every subsequent `save_to_disk` fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> u32 {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn account(&self, index: usize) -> Option<ManagedAccount> {
        self.accounts
            .read()
            .iter()
            .find(|a| a.index == index)
            .cloned()
    }
}

#[async_trait]
impl AccountManager for InMemoryAccountManager {
    fn accounts(&self) -> Vec<ManagedAccount> {
        self.accounts.read().clone()
    }

    fn update_from_auth(&self, account: &ManagedAccount, details: &OAuthAuthDetails) {
        if let Some(stored) = self
            .accounts
            .write()
            .iter_mut()
            .find(|a| a.index == account.index)
        {
            stored.apply(details);
        }
    }

    async fn save_to_disk(&self) -> Result<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(OAuthError::Storage("simulated save failure".to_string()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AccountStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Expiry summary of an account for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStatus {
    pub index: usize,
    pub email: Option<String>,
    /// Seconds until expiry, `None` when the expiry is unknown.
    pub expires_in_secs: Option<u64>,
    pub is_expired: bool,
    pub needs_refresh: bool,
}

impl AccountStatus {
    pub fn from_account(account: &ManagedAccount, now_ms: i64, buffer_ms: i64) -> Self {
        let expires_in_secs = account
            .expires
            .map(|expires| (expires.saturating_sub(now_ms).max(0) / 1000) as u64);
        Self {
            index: account.index,
            email: account.email.clone(),
            expires_in_secs,
            is_expired: is_expired_at(account, now_ms),
            needs_refresh: needs_refresh_at(account, now_ms, buffer_ms),
        }
    }

    pub fn expires_in_display(&self) -> String {
        match self.expires_in_secs {
            None => "Unknown".to_string(),
            Some(_) if self.is_expired => "Expired".to_string(),
            Some(secs) => {
                let hours = secs / 3600;
                let minutes = (secs % 3600) / 60;
                format!("{}h {}m", hours, minutes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BUFFER_MS: i64 = 1800 * 1000;

    #[test]
    fn test_unknown_expiry_never_refreshes() {
        let account = ManagedAccount::new(0, "rt");
        for now in [0, 1_700_000_000_000, i64::MAX] {
            assert!(!needs_refresh_at(&account, now, BUFFER_MS));
            assert!(!is_expired_at(&account, now));
        }
    }

    #[test]
    fn test_needs_refresh_boundary() {
        let now = 1_700_000_000_000;
        let inside = ManagedAccount::new(0, "rt").with_expires(now + BUFFER_MS - 1);
        assert!(needs_refresh_at(&inside, now, BUFFER_MS));

        let exact = ManagedAccount::new(0, "rt").with_expires(now + BUFFER_MS);
        assert!(needs_refresh_at(&exact, now, BUFFER_MS));

        let outside = ManagedAccount::new(0, "rt").with_expires(now + BUFFER_MS + 1);
        assert!(!needs_refresh_at(&outside, now, BUFFER_MS));
    }

    #[test]
    fn test_is_expired_boundary() {
        let now = 1_700_000_000_000;
        assert!(is_expired_at(&ManagedAccount::new(0, "rt").with_expires(now), now));
        assert!(!is_expired_at(&ManagedAccount::new(0, "rt").with_expires(now + 1), now));
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let temp = tempdir().unwrap();
        let store = FileAccountStore::open(temp.path().join("accounts.json"))
            .await
            .unwrap();
        assert!(store.accounts().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_update_and_save() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("accounts.json");
        let store = FileAccountStore::open(&path).await.unwrap();
        store.add(ManagedAccount::new(99, "rt-a").with_email("a@example.com"));
        store.add(ManagedAccount::new(99, "rt-b"));

        let accounts = store.accounts();
        assert_eq!(accounts[0].index, 0);
        assert_eq!(accounts[1].index, 1);

        let details = OAuthAuthDetails::new("fresh", 42_000, "rt-b2|proj");
        store.update_from_auth(&accounts[1], &details);
        store.save_to_disk().await.unwrap();

        let reopened = FileAccountStore::open(&path).await.unwrap();
        let accounts = reopened.accounts();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].email.as_deref(), Some("a@example.com"));
        assert_eq!(accounts[1].access.as_deref(), Some("fresh"));
        assert_eq!(accounts[1].expires, Some(42_000));
        assert_eq!(accounts[1].refresh, "rt-b2|proj");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("accounts.json");
        std::fs::write(&path, "not json").unwrap();
        let err = FileAccountStore::open(&path).await.unwrap_err();
        assert!(matches!(err, OAuthError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_in_memory_manager_save_failure() {
        let manager = InMemoryAccountManager::with_accounts(vec![ManagedAccount::new(0, "rt")]);
        manager.save_to_disk().await.unwrap();
        manager.fail_saves(true);
        assert!(manager.save_to_disk().await.is_err());
        assert_eq!(manager.save_count(), 2);
    }

    #[test]
    fn test_to_auth_details_default() {
        let manager = InMemoryAccountManager::new();
        let account = ManagedAccount::new(3, "rt|p").with_access("tok").with_expires(5);
        let details = manager.to_auth_details(&account);
        assert_eq!(details, OAuthAuthDetails::new("tok", 5, "rt|p"));
    }

    #[test]
    fn test_account_status_display() {
        let now = 1_700_000_000_000;
        let unknown = AccountStatus::from_account(&ManagedAccount::new(0, "rt"), now, BUFFER_MS);
        assert_eq!(unknown.expires_in_display(), "Unknown");

        let expired = AccountStatus::from_account(
            &ManagedAccount::new(0, "rt").with_expires(now - 1000),
            now,
            BUFFER_MS,
        );
        assert_eq!(expired.expires_in_display(), "Expired");
        assert!(expired.needs_refresh);

        let valid = AccountStatus::from_account(
            &ManagedAccount::new(0, "rt").with_expires(now + 7_200_000),
            now,
            BUFFER_MS,
        );
        assert_eq!(valid.expires_in_display(), "2h 0m");
        assert!(!valid.needs_refresh);
    }
}
