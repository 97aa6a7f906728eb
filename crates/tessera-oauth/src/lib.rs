//! Proactive OAuth token refresh for multi-account clients.
//!
//! Keeps every managed account's access token valid by refreshing it in the
//! background before it expires, without ever blocking a foreground request.
//!
//! # Components
//!
//! - [`retry`]: jittered exponential backoff and retry classification
//! - [`credentials`]: refresh blob encoding and refreshed auth details
//! - [`oauth`]: single `refresh_token` grant against the token endpoint
//! - [`refresher`]: [`TokenRefresher`]: bounded retries, cache invalidation
//! - [`accounts`]: the account store collaborator and a JSON-file store
//! - [`queue`]: [`ProactiveRefreshQueue`]: the background scheduler

pub mod accounts;
pub mod credentials;
pub mod error;
pub mod oauth;
pub mod queue;
pub mod refresher;
pub mod retry;

pub use accounts::{
    AccountManager, AccountStatus, FileAccountStore, InMemoryAccountManager, ManagedAccount,
    SharedAccountManager,
};
pub use credentials::{OAuthAuthDetails, RefreshParts, format_refresh_parts, parse_refresh_parts};
pub use error::{OAuthError, Result, TokenRefreshError};
pub use oauth::{OAuthConfig, TokenGrant};
pub use queue::{ProactiveRefreshConfig, ProactiveRefreshQueue, RefreshQueueStats};
pub use refresher::{
    CredentialRefresher, InMemoryRefreshCache, NoRefreshCache, RefreshCache, SharedRefresher,
    TokenRefresher,
};
pub use retry::{RetryPolicy, is_retryable};
