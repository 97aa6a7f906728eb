//! Token endpoint exchange for the `refresh_token` grant.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OAuthError, Result, TokenRefreshError};

/// Default token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Lifetime assumed when the endpoint omits or garbles `expires_in`.
pub const FALLBACK_EXPIRES_IN_SECS: u64 = 3600;

/// OAuth client configuration for the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

impl OAuthConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            ..Default::default()
        }
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }
}

/// A successful, validated token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: u64,
    /// Present only when the endpoint rotated the refresh token.
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponseBody {
    #[serde(default)]
    access_token: Option<Value>,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OAuth error payload. `error` is either a bare code or a nested object.
///
/// Every field is decoded on its own so one oddly typed value never hides
/// the others.
#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    error_description: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Code(String),
    Detail(ErrorDetail),
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
}

fn string_value(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Build a classified error from a non-success response body.
///
/// Unparseable bodies still yield an error carrying the HTTP status.
pub fn classify_error_response(status: u16, status_text: &str, body: &str) -> TokenRefreshError {
    let payload: ErrorPayload = serde_json::from_str(body).unwrap_or_default();

    let error = payload
        .error
        .and_then(|value| ErrorField::deserialize(value).ok());
    let (code, nested_description) = match error {
        Some(ErrorField::Code(code)) => (Some(code), None),
        Some(ErrorField::Detail(detail)) => {
            let code = string_value(detail.code).or_else(|| string_value(detail.status));
            (code, string_value(detail.message))
        }
        None => (None, None),
    };

    let description = string_value(payload.error_description)
        .or(nested_description)
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && serde_json::from_str::<Value>(trimmed).is_err())
                .then(|| trimmed.to_string())
        });

    TokenRefreshError {
        code: code.filter(|c| !c.is_empty()),
        description,
        status,
        status_text: status_text.to_string(),
    }
}

/// Validate a success body into a [`TokenGrant`].
pub fn parse_token_response(body: &str) -> Result<TokenGrant> {
    let parsed: TokenResponseBody = serde_json::from_str(body).map_err(|e| {
        OAuthError::TokenRefresh(
            TokenRefreshError::new(500, "Invalid Response")
                .with_description(format!("Token response is not valid JSON: {}", e)),
        )
    })?;

    let access_token = match parsed.access_token {
        Some(Value::String(token)) if !token.is_empty() => token,
        _ => {
            return Err(OAuthError::TokenRefresh(
                TokenRefreshError::new(500, "Invalid Response")
                    .with_description("Token response is missing access_token"),
            ));
        }
    };

    let expires_in = match parsed.expires_in.as_ref().and_then(Value::as_f64) {
        Some(secs) if secs > 0.0 => secs as u64,
        _ => {
            tracing::warn!(
                expires_in = ?parsed.expires_in,
                fallback_secs = FALLBACK_EXPIRES_IN_SECS,
                "Token response has no usable expires_in, assuming default lifetime"
            );
            FALLBACK_EXPIRES_IN_SECS
        }
    };

    Ok(TokenGrant {
        access_token,
        expires_in,
        refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
    })
}

/// Perform a single `refresh_token` grant against the token endpoint.
///
/// No retries happen here; see [`crate::refresher::TokenRefresher`].
pub async fn attempt_token_refresh(
    client: &Client,
    config: &OAuthConfig,
    refresh_token: &str,
) -> Result<TokenGrant> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
    ];

    let response = client.post(&config.token_url).form(&params).send().await?;

    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let error = classify_error_response(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            &body,
        );
        return Err(OAuthError::TokenRefresh(error));
    }

    parse_token_response(&body)
}
