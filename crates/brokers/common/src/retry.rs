use retry_policies::policies::ExponentialBackoff;
use retry_policies::{Jitter, RetryDecision, RetryPolicy};
use std::time::{Duration, SystemTime};

/// Bounded exponential backoff, doubling from `base_delay` up to `max_delay`.
///
/// `max_attempts` counts the first try, so `max_attempts = 1` disables retry.
/// With `jitter` set, each delay is drawn between `base_delay` and its
/// exponential value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let jitter = if self.jitter { Jitter::Bounded } else { Jitter::None };
        ExponentialBackoff::builder()
            .retry_bounds(self.base_delay, self.max_delay.max(self.base_delay))
            .jitter(jitter)
            .base(2)
            .build_with_max_retries(self.max_attempts.max(1) - 1)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        let now = SystemTime::now();
        match self.backoff().should_retry(now, retry.saturating_sub(1)) {
            RetryDecision::Retry { execute_after } => {
                Some(execute_after.duration_since(now).unwrap_or(Duration::ZERO))
            }
            RetryDecision::DoNotRetry => None,
        }
    }
}
