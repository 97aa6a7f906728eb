//! Backoff and retry classification for token refresh.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::OAuthError;

/// Extra attempts beyond the first.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before the first retry.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

/// Upper bound on the pre-jitter delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Fraction of the delay used as the jitter range for retries (±20%).
pub const RETRY_JITTER_RATIO: f64 = 0.2;

/// Exponential backoff policy for token endpoint calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap applied before jitter, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// Doubles from the initial delay, caps at `max_delay_ms`, then applies
    /// ±20% uniform jitter. The result never exceeds `max_delay_ms * 1.2`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let base = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        jitter(Duration::from_millis(base), RETRY_JITTER_RATIO)
    }

    /// Upper bound of any value `backoff_delay` can return.
    pub fn max_jittered_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms).mul_f64(1.0 + RETRY_JITTER_RATIO)
    }
}

/// Whether a failed refresh attempt may be retried.
///
/// Permanent credential errors (`invalid_grant`, `invalid_client`) never are.
/// Server errors, rate limits and transport failures are. Anything else is not.
pub fn is_retryable(error: &OAuthError) -> bool {
    match error {
        OAuthError::TokenRefresh(e) => {
            if e.is_permanent() {
                return false;
            }
            e.status >= 500 || e.status == 429
        }
        OAuthError::Network(_) => true,
        _ => false,
    }
}

/// Perturb `base` by a uniform factor in `[1 - ratio, 1 + ratio]`.
pub fn jitter(base: Duration, ratio: f64) -> Duration {
    if base.is_zero() || ratio <= 0.0 {
        return base;
    }
    let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
    base.mul_f64(factor.max(0.0))
}
