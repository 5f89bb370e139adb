use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::config::Config;

/// Request pacing shared by every worker.
///
/// The governor quota caps the total request rate regardless of pool size;
/// the random delay on top keeps individual requests from landing in lockstep.
pub struct Throttle {
    limiter: Arc<DefaultDirectRateLimiter>,
    delay_min_ms: u64,
    delay_max_ms: u64,
}

impl Throttle {
    pub fn new(requests_per_second: u32, delay_min_ms: u64, delay_max_ms: u64) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
            delay_min_ms,
            delay_max_ms: delay_max_ms.max(delay_min_ms),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.requests_per_second,
            config.delay_min_ms,
            config.delay_max_ms,
        )
    }

    /// Wait for a rate-limit slot, then sleep a random polite interval.
    pub async fn wait(&self) {
        self.limiter.until_ready().await;
        let delay = fastrand::u64(self.delay_min_ms..=self.delay_max_ms);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }

    /// Delay before retry number `retry` (1-based): base·2^(retry-1) plus up to one base of jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << retry.saturating_sub(1).min(16));
        let jitter = fastrand::u64(0..=base);
        Duration::from_millis(exp.saturating_add(jitter))
    }
}
