//! Error types for token refresh.

use std::fmt;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, OAuthError>;

/// Errors that can occur while keeping credentials fresh.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Network/transport error before any HTTP status was received.
    #[error("Network error: {0}")]
    Network(String),

    /// The token endpoint rejected the exchange with a classified error.
    #[error("Token refresh failed: {0}")]
    TokenRefresh(TokenRefreshError),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Durable storage error (account file read/write).
    #[error("Storage error: {0}")]
    Storage(String),
}

impl OAuthError {
    /// The classified token endpoint error, if this is one.
    pub fn as_token_refresh(&self) -> Option<&TokenRefreshError> {
        match self {
            Self::TokenRefresh(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OAuthError::Network(format!("Request timed out: {}", e))
        } else if e.is_connect() {
            OAuthError::Network(format!("Connection failed: {}", e))
        } else {
            OAuthError::Network(e.to_string())
        }
    }
}

impl From<TokenRefreshError> for OAuthError {
    fn from(e: TokenRefreshError) -> Self {
        OAuthError::TokenRefresh(e)
    }
}

/// A token endpoint failure classified from the HTTP status and error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRefreshError {
    /// OAuth error code (`invalid_grant`, `invalid_client`, ...), when the payload had one.
    pub code: Option<String>,
    /// Human-readable description from the payload.
    pub description: Option<String>,
    /// HTTP status code.
    pub status: u16,
    /// HTTP status reason phrase.
    pub status_text: String,
}

impl TokenRefreshError {
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            code: None,
            description: None,
            status,
            status_text: status_text.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The endpoint reported `invalid_grant`: the refresh token was revoked.
    pub fn is_invalid_grant(&self) -> bool {
        self.code.as_deref() == Some("invalid_grant")
    }

    /// The credential itself is unusable and the account must re-authenticate.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("invalid_grant") | Some("invalid_client")
        )
    }
}

impl fmt::Display for TokenRefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.status_text)?;
        if let Some(code) = &self.code {
            write!(f, " ({})", code)?;
        }
        if let Some(description) = &self.description {
            write!(f, ": {}", description)?;
        }
        Ok(())
    }
}
