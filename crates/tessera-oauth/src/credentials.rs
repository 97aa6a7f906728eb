//! Refresh credential encoding and refreshed auth details.
//!
//! A stored refresh credential is a single string of `|`-separated segments:
//! `refreshToken|projectId|managedProjectId`. Segments past the third belong
//! to other components and are carried through untouched.

use serde::{Deserialize, Serialize};

const SEPARATOR: char = '|';

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Decomposed refresh credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshParts {
    pub refresh_token: Option<String>,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
    /// Segments this crate does not interpret, in their original order.
    pub extra: Vec<String>,
}

impl RefreshParts {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: Some(refresh_token.into()),
            ..Default::default()
        }
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_managed_project_id(mut self, managed: impl Into<String>) -> Self {
        self.managed_project_id = Some(managed.into());
        self
    }
}

fn non_empty(segment: Option<&str>) -> Option<String> {
    segment.filter(|s| !s.is_empty()).map(String::from)
}

/// Split a stored refresh blob into its parts.
pub fn parse_refresh_parts(blob: &str) -> RefreshParts {
    let mut segments = blob.split(SEPARATOR);
    let refresh_token = non_empty(segments.next());
    let project_id = non_empty(segments.next());
    let managed_project_id = non_empty(segments.next());
    let extra = segments.map(String::from).collect();
    RefreshParts {
        refresh_token,
        project_id,
        managed_project_id,
        extra,
    }
}

/// Join parts back into a stored refresh blob.
///
/// Trailing empty segments are dropped unless unknown segments follow them.
pub fn format_refresh_parts(parts: &RefreshParts) -> String {
    let mut segments: Vec<&str> = vec![
        parts.refresh_token.as_deref().unwrap_or(""),
        parts.project_id.as_deref().unwrap_or(""),
        parts.managed_project_id.as_deref().unwrap_or(""),
    ];
    if parts.extra.is_empty() {
        while segments.len() > 1 && segments.last().is_some_and(|s| s.is_empty()) {
            segments.pop();
        }
    } else {
        segments.extend(parts.extra.iter().map(String::as_str));
    }
    segments.join(&SEPARATOR.to_string())
}

/// Credentials produced by a successful refresh.
///
/// Never mutated after construction; every refresh yields a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthAuthDetails {
    /// Bearer access token.
    pub access: String,
    /// Absolute expiry in epoch milliseconds.
    pub expires: i64,
    /// Serialized refresh blob (see [`parse_refresh_parts`]).
    pub refresh: String,
}

impl OAuthAuthDetails {
    pub fn new(access: impl Into<String>, expires: i64, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            expires,
            refresh: refresh.into(),
        }
    }

    /// Decoded view of the refresh blob.
    pub fn refresh_parts(&self) -> RefreshParts {
        parse_refresh_parts(&self.refresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_blob() {
        let parts = parse_refresh_parts("1//rt|proj-a|managed-b");
        assert_eq!(parts.refresh_token.as_deref(), Some("1//rt"));
        assert_eq!(parts.project_id.as_deref(), Some("proj-a"));
        assert_eq!(parts.managed_project_id.as_deref(), Some("managed-b"));
        assert!(parts.extra.is_empty());
    }

    #[test]
    fn test_parse_token_only() {
        let parts = parse_refresh_parts("1//rt");
        assert_eq!(parts, RefreshParts::new("1//rt"));
        assert_eq!(format_refresh_parts(&parts), "1//rt");
    }

    #[test]
    fn test_parse_empty_blob_has_no_token() {
        let parts = parse_refresh_parts("");
        assert!(parts.refresh_token.is_none());

        let parts = parse_refresh_parts("|proj");
        assert!(parts.refresh_token.is_none());
        assert_eq!(parts.project_id.as_deref(), Some("proj"));
    }

    #[test]
    fn test_unknown_segments_survive_round_trip() {
        let blob = "rt||managed|v2|flag=1";
        let parts = parse_refresh_parts(blob);
        assert!(parts.project_id.is_none());
        assert_eq!(parts.extra, vec!["v2".to_string(), "flag=1".to_string()]);
        assert_eq!(format_refresh_parts(&parts), blob);
    }

    #[test]
    fn test_format_drops_trailing_empty_segments() {
        let parts = RefreshParts::new("rt").with_project_id("proj");
        assert_eq!(format_refresh_parts(&parts), "rt|proj");

        let parts = RefreshParts::new("rt").with_managed_project_id("m");
        assert_eq!(format_refresh_parts(&parts), "rt||m");
    }

    #[test]
    fn test_auth_details_refresh_parts() {
        let details = OAuthAuthDetails::new("ya29.token", 1_700_000_000_000, "rt|proj");
        let parts = details.refresh_parts();
        assert_eq!(parts.refresh_token.as_deref(), Some("rt"));
        assert_eq!(parts.project_id.as_deref(), Some("proj"));
    }
}
