//! Error types for stream transformation.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors surfaced by the byte stream adapter.
///
/// Record parsing never fails; malformed records pass through verbatim.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The upstream byte stream failed.
    #[error("Upstream stream error: {0}")]
    Upstream(String),
}
