//! Retry timing

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderValue;

use crate::config::DeliveryConfig;

/// Exponential backoff: `base * 2^attempts`, saturating
pub fn backoff(base: Duration, attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Parse a `Retry-After` value given as delta-seconds or an HTTP-date
///
/// Dates in the past yield zero; unparsable values yield `None`.
pub fn parse_retry_after(value: &HeaderValue, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        date.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or_default(),
    )
}

/// Retry limits applied by every worker of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a delivery is dropped
    pub max_attempts: u32,
    /// Backoff base
    pub base: Duration,
    /// Upper bound for honoured `Retry-After` values
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: config.base_backoff(),
            max_retry_after: config.max_retry_after(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` failures
    pub fn delay(&self, attempts: u32, retry_after: Option<Duration>) -> Duration {
        let computed = backoff(self.base, attempts);
        match retry_after {
            Some(requested) => computed.max(requested.min(self.max_retry_after)),
            None => computed,
        }
    }

    /// Whether a delivery with `attempts` failures is out of attempts
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
