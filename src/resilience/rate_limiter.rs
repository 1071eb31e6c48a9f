//! Token-bucket rate limiter with lazy refill.
//!
//! Capacity regenerates continuously up to a cap; each `acquire` consumes one
//! whole token. Refill happens lazily on every call from the elapsed
//! wall-clock time, so no background timer exists. Rejection is immediate:
//! the limiter never sleeps on behalf of the caller.

use crate::{ErrorContext, Result, VisionError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimiterSnapshot {
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    /// Estimated wait until a whole token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

/// Counters maintained across the limiter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateLimiterStats {
    pub total_allowed: u64,
    pub total_rejected: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum bucket size (tokens).
    pub max_tokens: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl RateLimiterConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self {
            max_tokens: 10.0,
            refill_rate: 10.0,
        }
    }

    /// Set the maximum tokens (bucket size)
    pub fn with_max_tokens(mut self, tokens: f64) -> Self {
        self.max_tokens = tokens;
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter.
///
/// One shared instance guards one logical backend; constructing a fresh
/// limiter per call defeats the coordination entirely.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
    total_allowed: AtomicU64,
    total_rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let tokens = cfg.max_tokens;
        Self {
            cfg,
            state: Mutex::new(State {
                tokens,
                last_refill: Instant::now(),
            }),
            total_allowed: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    fn refill_locked(cfg: &RateLimiterConfig, st: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * cfg.refill_rate).min(cfg.max_tokens);
            st.last_refill = now;
        }
    }

    /// Attempt to consume one token.
    ///
    /// Consumption requires a whole token (>= 1.0); fractional remainders
    /// stay in the bucket. Returns `Err(RateLimited)` with a wait hint when
    /// the bucket is empty.
    pub fn acquire(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Self::refill_locked(&self.cfg, &mut st);

        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            drop(st);
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let wait_ms = Self::wait_hint_ms(&self.cfg, &st);
        drop(st);
        self.total_rejected.fetch_add(1, Ordering::Relaxed);

        let mut context = ErrorContext::new().with_source("rate_limiter");
        if let Some(ms) = wait_ms {
            context = context.with_retry_after_ms(ms);
        }
        Err(VisionError::rate_limited("rate limit exceeded").with_context(context))
    }

    fn wait_hint_ms(cfg: &RateLimiterConfig, st: &State) -> Option<u64> {
        if cfg.refill_rate <= 0.0 {
            return None;
        }
        let missing = 1.0 - st.tokens;
        if missing <= 0.0 {
            return None;
        }
        Some((missing / cfg.refill_rate * 1000.0).ceil() as u64)
    }

    /// Lifetime allow/reject counters.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_allowed: self.total_allowed.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    /// Point-in-time view of the bucket, refilled as of now.
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Self::refill_locked(&self.cfg, &mut st);
        let estimated_wait_ms = if st.tokens >= 1.0 {
            None
        } else {
            Self::wait_hint_ms(&self.cfg, &st)
        };
        RateLimiterSnapshot {
            max_tokens: self.cfg.max_tokens,
            refill_rate: self.cfg.refill_rate,
            tokens: st.tokens,
            estimated_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_builder() {
        let config = RateLimiterConfig::new()
            .with_max_tokens(100.0)
            .with_refill_rate(50.0);
        assert_eq!(config.max_tokens, 100.0);
        assert_eq!(config.refill_rate, 50.0);
    }

    #[test]
    fn test_initial_bucket_is_full() {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_max_tokens(3.0));
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());
    }

    #[test]
    fn test_rejects_when_empty() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tokens(2.0)
                .with_refill_rate(20.0),
        );
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());

        let err = limiter.acquire().unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::RateLimited);
        assert!(err.retry_after_ms().is_some());
    }

    #[test]
    fn test_refill_allows_after_wait() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tokens(2.0)
                .with_refill_rate(20.0), // one token per 50ms
        );
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_err());

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.acquire().is_ok());
    }

    #[test]
    fn test_fractional_tokens_cannot_be_consumed() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tokens(1.0)
                .with_refill_rate(10.0), // 0.1 tokens per 10ms
        );
        assert!(limiter.acquire().is_ok());

        // A short sleep refills a fraction only; still not a whole token.
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.acquire().is_err());
        let snapshot = limiter.snapshot();
        assert!(snapshot.tokens > 0.0 && snapshot.tokens < 1.0);
    }

    #[test]
    fn test_refill_caps_at_max_tokens() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tokens(2.0)
                .with_refill_rate(1000.0),
        );
        std::thread::sleep(Duration::from_millis(20));
        let snapshot = limiter.snapshot();
        assert!(snapshot.tokens <= 2.0);
    }

    #[test]
    fn test_stats_counters() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tokens(1.0)
                .with_refill_rate(0.1),
        );
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_err());
        assert!(limiter.acquire().is_err());

        let stats = limiter.stats();
        assert_eq!(stats.total_allowed, 1);
        assert_eq!(stats.total_rejected, 2);
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tokens(50.0)
                .with_refill_rate(0.0),
        ));

        let mut handles = vec![];
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                let mut allowed = 0u64;
                for _ in 0..10 {
                    if limiter.acquire().is_ok() {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(limiter.stats().total_rejected, 50);
    }
}
