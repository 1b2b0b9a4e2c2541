use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::{AttemptError, LocationMode, RetryConfig, RetryStrategy, StorageLocation};

/// What the executor tells the policy after a retryable failure
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Retries already performed (0 when the first attempt just failed)
    pub retry_count: u32,
    pub last_location: StorageLocation,
    /// Location the current mode would try next
    pub next_location: StorageLocation,
    pub location_mode: LocationMode,
    pub failure: &'a AttemptError,
}

/// A decision to retry: where, under which mode, after how long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInfo {
    pub target_location: StorageLocation,
    pub updated_location_mode: LocationMode,
    pub delay: Duration,
}

impl RetryInfo {
    /// Follow the mode's suggested location after `delay`
    pub fn from_context(context: &RetryContext<'_>, delay: Duration) -> Self {
        Self {
            target_location: context.next_location,
            updated_location_mode: context.location_mode,
            delay,
        }
    }
}

/// Decides whether a failed attempt is retried
///
/// Only consulted for failures already classified retryable; fatal failures
/// never reach the policy.
pub trait RetryPolicy: Send + Sync {
    /// `None` ends the operation with the last failure
    fn evaluate(&self, context: &RetryContext<'_>) -> Option<RetryInfo>;
}

/// Never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn evaluate(&self, _context: &RetryContext<'_>) -> Option<RetryInfo> {
        None
    }
}

/// Fixed delay between attempts
#[derive(Debug, Clone)]
pub struct LinearRetry {
    pub delay: Duration,
    pub max_retries: u32,
}

impl LinearRetry {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryPolicy for LinearRetry {
    fn evaluate(&self, context: &RetryContext<'_>) -> Option<RetryInfo> {
        if context.retry_count >= self.max_retries {
            return None;
        }
        Some(RetryInfo::from_context(context, self.delay))
    }
}

/// Exponential backoff with jitter, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialRetry {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl ExponentialRetry {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    /// Backoff before retry number `retry_count + 1`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry_count.min(16));
        let raw = self.base_delay.saturating_mul(factor);
        let capped = std::cmp::min(raw, self.max_delay);
        if capped.is_zero() {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        std::cmp::min(capped.mul_f64(jitter), self.max_delay)
    }
}

impl RetryPolicy for ExponentialRetry {
    fn evaluate(&self, context: &RetryContext<'_>) -> Option<RetryInfo> {
        if context.retry_count >= self.max_retries {
            return None;
        }
        Some(RetryInfo::from_context(context, self.backoff(context.retry_count)))
    }
}

/// Build the default policy described by a retry config
pub fn policy_from_config(config: &RetryConfig) -> Arc<dyn RetryPolicy> {
    match config.strategy {
        RetryStrategy::Exponential => Arc::new(ExponentialRetry::new(
            config.max_retries,
            config.base_delay,
            config.max_delay,
        )),
        RetryStrategy::Linear => Arc::new(LinearRetry::new(config.max_retries, config.base_delay)),
        RetryStrategy::None => Arc::new(NoRetry),
    }
}
