//! Caller-side retry with exponential backoff and jitter.
//!
//! Registry and cache operations never retry internally; wrap them here when
//! a retry policy is wanted, e.g. to repair a cache after a failed download.

use rand::{thread_rng, Rng};
use std::time::Duration;
use tracing::warn;

use crate::error::CoachError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(200), max_delay: Duration::from_secs(5), jitter: 0.25 } }
}

impl RetryConfig {
    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or
/// `max_retries` extra attempts are spent. `op` receives the attempt number.
pub async fn retry_async<F, Fut, T, E, P>(cfg: &RetryConfig, should_retry: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !should_retry(&e) => return Err(e),
            Err(e) => {
                let delay = cfg.delay_for(attempt);
                warn!(attempt, ?delay, error = %e, "operation failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

/// Retry predicate for [`CoachError`]: transport and disk failures only.
pub fn transient(e: &CoachError) -> bool { e.is_transient() }
