//! Token refresh with bounded, jittered retries.
//!
//! [`TokenRefresher`] turns a stored refresh credential into fresh
//! [`OAuthAuthDetails`]. Failures are handled by class:
//!
//! - `invalid_grant` / `invalid_client` are surfaced immediately; on
//!   `invalid_grant` everything cached under the old refresh blob is purged.
//! - 5xx, 429 and transport failures are retried with [`RetryPolicy`].
//! - Classified errors that are not retried (or ran out of attempts) are
//!   returned to the caller. Anything unclassified is logged and reported as
//!   `Ok(None)` so a background scheduler keeps running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::credentials::{OAuthAuthDetails, RefreshParts, format_refresh_parts, now_millis};
use crate::error::{OAuthError, Result};
use crate::oauth::{OAuthConfig, TokenGrant, attempt_token_refresh};
use crate::retry::{RetryPolicy, is_retryable};

// ─────────────────────────────────────────────────────────────────────────────
// Refresh cache collaborator
// ─────────────────────────────────────────────────────────────────────────────

/// Storage for auth details and state derived from a refresh credential.
///
/// Keys are serialized refresh blobs. Refreshing a credential invalidates
/// everything derived from the blob it replaced.
pub trait RefreshCache: Send + Sync + std::fmt::Debug {
    /// Remember freshly issued auth details.
    fn store_auth(&self, details: &OAuthAuthDetails);

    /// Forget auth details cached under `refresh`.
    fn clear_auth(&self, refresh: &str);

    /// Drop downstream state (project lookups and the like) derived from `refresh`.
    fn invalidate_derived(&self, refresh: &str);
}

/// A cache that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRefreshCache;

impl RefreshCache for NoRefreshCache {
    fn store_auth(&self, _details: &OAuthAuthDetails) {}
    fn clear_auth(&self, _refresh: &str) {}
    fn invalidate_derived(&self, _refresh: &str) {}
}

/// Process-local refresh cache.
#[derive(Debug, Default)]
pub struct InMemoryRefreshCache {
    auth: RwLock<HashMap<String, OAuthAuthDetails>>,
    project_context: RwLock<HashMap<String, String>>,
}

impl InMemoryRefreshCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached auth details for a refresh blob.
    pub fn auth(&self, refresh: &str) -> Option<OAuthAuthDetails> {
        self.auth.read().get(refresh).cloned()
    }

    /// Record a resolved project for a refresh blob.
    pub fn store_project_context(&self, refresh: &str, project_id: impl Into<String>) {
        self.project_context
            .write()
            .insert(refresh.to_string(), project_id.into());
    }

    /// Resolved project for a refresh blob, if still valid.
    pub fn project_context(&self, refresh: &str) -> Option<String> {
        self.project_context.read().get(refresh).cloned()
    }
}

impl RefreshCache for InMemoryRefreshCache {
    fn store_auth(&self, details: &OAuthAuthDetails) {
        self.auth
            .write()
            .insert(details.refresh.clone(), details.clone());
    }

    fn clear_auth(&self, refresh: &str) {
        self.auth.write().remove(refresh);
    }

    fn invalidate_derived(&self, refresh: &str) {
        self.project_context.write().remove(refresh);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CredentialRefresher
// ─────────────────────────────────────────────────────────────────────────────

/// Refreshes one account's credential.
///
/// `Ok(None)` means nothing was refreshed and is not a failure.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(
        &self,
        auth: &OAuthAuthDetails,
        cancel: &CancellationToken,
    ) -> Result<Option<OAuthAuthDetails>>;
}

/// Shared refresher handle.
pub type SharedRefresher = Arc<dyn CredentialRefresher>;

// ─────────────────────────────────────────────────────────────────────────────
// TokenRefresher
// ─────────────────────────────────────────────────────────────────────────────

/// Refreshes credentials against the OAuth token endpoint.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    client: Client,
    config: OAuthConfig,
    policy: RetryPolicy,
    cache: Arc<dyn RefreshCache>,
}

impl TokenRefresher {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            policy: RetryPolicy::default(),
            cache: Arc::new(NoRefreshCache),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn RefreshCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Refresh `auth`, retrying transient failures.
    pub async fn refresh_access_token(
        &self,
        auth: &OAuthAuthDetails,
        cancel: &CancellationToken,
    ) -> Result<Option<OAuthAuthDetails>> {
        let parts = auth.refresh_parts();
        let Some(refresh_token) = parts.refresh_token.clone() else {
            tracing::debug!("No refresh token in stored credential, skipping refresh");
            return Ok(None);
        };

        let mut attempt = 0;
        loop {
            let issued_at = now_millis();
            let err = match attempt_token_refresh(&self.client, &self.config, &refresh_token).await
            {
                Ok(grant) => {
                    let details = refreshed_details(&parts, grant, issued_at);
                    self.cache.invalidate_derived(&auth.refresh);
                    self.cache.store_auth(&details);
                    tracing::debug!(attempt, expires = details.expires, "Token refreshed");
                    return Ok(Some(details));
                }
                Err(err) => err,
            };

            if let OAuthError::TokenRefresh(classified) = &err {
                if classified.is_invalid_grant() {
                    tracing::error!(
                        status = classified.status,
                        description = classified.description.as_deref().unwrap_or(""),
                        "Refresh token revoked, account must re-authenticate"
                    );
                    self.cache.invalidate_derived(&auth.refresh);
                    self.cache.clear_auth(&auth.refresh);
                    return Err(err);
                }
            }

            if is_retryable(&err) && attempt < self.policy.max_retries {
                let delay = self.policy.backoff_delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = self.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Token refresh failed, retrying"
                );
                if !sleep_or_cancel(delay, cancel).await {
                    tracing::debug!("Token refresh retry cancelled");
                    return give_up(err);
                }
                attempt += 1;
                continue;
            }

            return give_up(err);
        }
    }
}

#[async_trait]
impl CredentialRefresher for TokenRefresher {
    async fn refresh(
        &self,
        auth: &OAuthAuthDetails,
        cancel: &CancellationToken,
    ) -> Result<Option<OAuthAuthDetails>> {
        self.refresh_access_token(auth, cancel).await
    }
}

/// Classified errors are actionable and surface; anything else is swallowed.
fn give_up(err: OAuthError) -> Result<Option<OAuthAuthDetails>> {
    match err {
        OAuthError::TokenRefresh(_) => Err(err),
        other => {
            tracing::warn!(error = %other, "Unexpected token refresh failure, giving up");
            Ok(None)
        }
    }
}

fn refreshed_details(parts: &RefreshParts, grant: TokenGrant, issued_at: i64) -> OAuthAuthDetails {
    let mut next = parts.clone();
    if let Some(rotated) = grant.refresh_token {
        next.refresh_token = Some(rotated);
    }
    let lifetime_ms = i64::try_from(grant.expires_in.saturating_mul(1000)).unwrap_or(i64::MAX);
    OAuthAuthDetails {
        access: grant.access_token,
        expires: issued_at.saturating_add(lifetime_ms),
        refresh: format_refresh_parts(&next),
    }
}

/// Sleep for `delay`. Returns `false` if `cancel` fired first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refreshed_details_keeps_old_token_when_not_rotated() {
        let parts = RefreshParts::new("old-rt").with_project_id("proj");
        let grant = TokenGrant {
            access_token: "access".to_string(),
            expires_in: 60,
            refresh_token: None,
        };
        let details = refreshed_details(&parts, grant, 1_000);
        assert_eq!(details.refresh, "old-rt|proj");
        assert_eq!(details.expires, 61_000);
        assert_eq!(details.access, "access");
    }

    #[test]
    fn test_refreshed_details_uses_rotated_token() {
        let mut parts = RefreshParts::new("old-rt").with_managed_project_id("m");
        parts.extra.push("keep".to_string());
        let grant = TokenGrant {
            access_token: "access".to_string(),
            expires_in: 3600,
            refresh_token: Some("new-rt".to_string()),
        };
        let details = refreshed_details(&parts, grant, 0);
        assert_eq!(details.refresh, "new-rt||m|keep");
    }

    #[test]
    fn test_in_memory_cache_invalidation() {
        let cache = InMemoryRefreshCache::new();
        let details = OAuthAuthDetails::new("a", 1, "rt|proj");
        cache.store_auth(&details);
        cache.store_project_context("rt|proj", "resolved-proj");

        assert_eq!(cache.auth("rt|proj"), Some(details));
        cache.invalidate_derived("rt|proj");
        assert!(cache.project_context("rt|proj").is_none());
        cache.clear_auth("rt|proj");
        assert!(cache.auth("rt|proj").is_none());
    }

    #[tokio::test]
    async fn test_no_refresh_token_is_noop() {
        let refresher = TokenRefresher::new(OAuthConfig::default().with_token_url("http://127.0.0.1:9"));
        let auth = OAuthAuthDetails::new("a", 0, "|proj");
        let result = refresher
            .refresh_access_token(&auth, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_give_up_swallows_unclassified() {
        assert!(matches!(
            give_up(OAuthError::Network("reset".to_string())),
            Ok(None)
        ));
        let classified = crate::error::TokenRefreshError::new(503, "Service Unavailable");
        assert!(give_up(OAuthError::TokenRefresh(classified)).is_err());
    }
}
