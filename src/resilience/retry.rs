//! Retry with exponential backoff.
//!
//! The delay before attempt `n + 1` is `min(base_delay * 2^n, max_delay)`,
//! unless the error carries a `retry_after_ms` hint, which takes precedence
//! (still capped at `max_delay`). Delays suspend the caller via
//! `tokio::time::sleep`; there is no busy-waiting.

use crate::context::ExecutionContext;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    fn backoff_delay(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        // exponential backoff: base * 2^attempt
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let computed = base.saturating_mul(factor);
        let chosen = retry_after_ms.unwrap_or(computed).min(cap);
        Duration::from_millis(chosen)
    }
}

/// Repeatedly invoke `op` until it succeeds, attempts are exhausted, or the
/// governing context is done.
///
/// `op` receives the 0-based attempt number. On exhaustion the last observed
/// error is returned; a context that expires between attempts surfaces as
/// `Err(DeadlineExceeded)`. Sleeps are clamped to the context's remaining
/// time so a deadline is never overshot by a backoff delay.
pub async fn with_retry<T, F, Fut>(
    ctx: &ExecutionContext,
    cfg: &RetryConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = cfg.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        ctx.check()?;

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(err);
                }
                let mut delay = cfg.backoff_delay(attempt - 1, err.retry_after_ms());
                if let Some(remaining) = ctx.remaining() {
                    delay = delay.min(remaining);
                }
                debug!(
                    attempt = attempt - 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
