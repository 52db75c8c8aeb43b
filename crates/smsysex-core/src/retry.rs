//! Bounded exponential backoff for transient device errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy applied to retryable device errors.
///
/// Defaults: 3 attempts, 100 ms base delay, doubling per attempt. Only the
/// statuses flagged retryable by
/// [`DeviceStatus::is_retryable`](crate::error::DeviceStatus::is_retryable)
/// are ever retried; everything else fails on the first attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Multiplier applied per subsequent retry
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Backoff cap so a misconfigured multiplier cannot stall a transfer.
    const MAX_DELAY: Duration = Duration::from_secs(5);

    /// Delay to sleep before retry number `attempt` (zero-based: the delay
    /// after the first failure is `delay(0)`).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor)).min(Self::MAX_DELAY)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}
