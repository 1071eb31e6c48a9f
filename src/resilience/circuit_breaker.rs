//! Per-backend circuit breaker.
//!
//! A breaker fails fast once its backend is judged unhealthy, avoiding
//! wasted calls while the backend recovers. All time-based transitions are
//! evaluated lazily at [`CircuitBreaker::is_available`] / `execute` call
//! sites; there is no background timer, so state goes stale between calls
//! and is reconciled on the next check.
//!
//! State machine (initial: `Closed`):
//!
//! - `Closed` -> `Open` once `consecutive_failures` reaches the threshold.
//! - `Open`: every call is rejected with `CIRCUIT_OPEN` until the reset
//!   timeout elapses; the guarded operation is never invoked.
//! - `Open` -> `HalfOpen` after the reset timeout, on the next check.
//! - `HalfOpen`: exactly one trial call is admitted. Success closes the
//!   breaker and resets the failure count; failure re-opens it with a fresh
//!   `opened_at`.

use crate::context::ExecutionContext;
use crate::{ErrorContext, Result, VisionError};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Breaker states, observable via [`CircuitBreaker::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of consecutive failures that opens the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open before a half-open trial
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    // Invariant: state == Open => opened_at is Some.
    trial_in_flight: bool,
}

/// Circuit breaker guarding one named backend.
///
/// One shared instance per logical backend; the name only labels logs and
/// snapshots.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Move `Open` -> `HalfOpen` once the reset timeout has elapsed. This is
    /// the canonical place elapsed-time transitions happen.
    fn reconcile_locked(&self, st: &mut State) {
        if st.state == CircuitState::Open {
            // Invariant: an open circuit always records its opening time.
            if let Some(opened_at) = st.opened_at {
                if opened_at.elapsed() >= self.cfg.reset_timeout {
                    st.state = CircuitState::HalfOpen;
                    st.trial_in_flight = false;
                    debug!(backend = self.name.as_str(), "circuit half-open after reset timeout");
                }
            }
        }
    }

    /// Whether a call would currently be admitted.
    ///
    /// Performs the lazy `Open -> HalfOpen` transition as a side effect.
    pub fn is_available(&self) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.reconcile_locked(&mut st);
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !st.trial_in_flight,
        }
    }

    /// Current state, reconciled against elapsed time.
    pub fn state(&self) -> CircuitState {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.reconcile_locked(&mut st);
        st.state
    }

    /// Record a successful call: close the circuit and reset the streak.
    pub fn record_success(&self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if st.state != CircuitState::Closed {
            debug!(backend = self.name.as_str(), "circuit closed after successful trial");
        }
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.opened_at = None;
        st.trial_in_flight = false;
    }

    /// Record a failed call, opening the circuit at the threshold (or
    /// immediately re-opening after a failed half-open trial).
    pub fn record_failure(&self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        let reopen = st.state == CircuitState::HalfOpen;
        if reopen || st.consecutive_failures >= self.cfg.failure_threshold {
            st.state = CircuitState::Open;
            st.opened_at = Some(Instant::now());
            st.trial_in_flight = false;
            warn!(
                backend = self.name.as_str(),
                consecutive_failures = st.consecutive_failures,
                reset_timeout_ms = self.cfg.reset_timeout.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    /// Admit one call, marking the half-open trial as taken when applicable.
    /// Returns `Err(CircuitOpen)` when the call must be rejected.
    fn admit(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.reconcile_locked(&mut st);
        match st.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !st.trial_in_flight => {
                st.trial_in_flight = true;
                Ok(())
            }
            _ => {
                let remaining_ms = st
                    .opened_at
                    .map(|at| {
                        self.cfg
                            .reset_timeout
                            .saturating_sub(at.elapsed())
                            .as_millis() as u64
                    })
                    .unwrap_or(0);
                Err(VisionError::circuit_open(format!(
                    "circuit open for backend '{}'",
                    self.name
                ))
                .with_context(
                    ErrorContext::new()
                        .with_source("circuit_breaker")
                        .with_retry_after_ms(remaining_ms),
                ))
            }
        }
    }

    /// Execute a guarded operation through the breaker.
    ///
    /// Short-circuits with `Err(CircuitOpen)` when unavailable; otherwise
    /// invokes the operation, records the outcome, and propagates the inner
    /// result unchanged.
    pub async fn execute<T, F, Fut>(&self, ctx: &ExecutionContext, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        ctx.check()?;
        self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.reconcile_locked(&mut st);
        let open_remaining_ms = match st.state {
            CircuitState::Open => st.opened_at.map(|at| {
                self.cfg
                    .reset_timeout
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64
            }),
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            failure_threshold: self.cfg.failure_threshold,
            reset_timeout_ms: self.cfg.reset_timeout.as_millis() as u64,
            open_remaining_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-backend",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_reset_timeout(reset),
        )
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = breaker(3, Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_available());
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(2, Duration::from_secs(30));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());
        assert!(cb.snapshot().open_remaining_ms.is_some());
    }

    #[test]
    fn test_success_resets_streak_without_state_change() {
        let cb = breaker(3, Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.snapshot().consecutive_failures, 2);
        cb.record_success();
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_reset_timeout() {
        let cb = breaker(1, Duration::from_millis(40));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_available());
    }

    #[test]
    fn test_failed_trial_reopens_with_fresh_window() {
        let cb = breaker(1, Duration::from_millis(40));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        let remaining = cb.snapshot().open_remaining_ms.unwrap();
        assert!(remaining > 20, "re-open must start a fresh window, got {remaining}ms");
    }

    #[tokio::test]
    async fn test_execute_rejects_without_invoking_when_open() {
        let cb = breaker(2, Duration::from_secs(30));
        let ctx = ExecutionContext::background();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result: Result<()> = cb
                .execute(&ctx, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(VisionError::provider_error("boom"))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = cb
            .execute(&ctx, move || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "open circuit must not invoke");
    }

    #[tokio::test]
    async fn test_trial_success_closes() {
        let cb = breaker(2, Duration::from_millis(40));
        let ctx = ExecutionContext::background();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let result = cb.execute(&ctx, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_trial() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));

        assert!(cb.is_available());
        assert!(cb.admit().is_ok());
        // Trial in flight: a concurrent caller is shielded.
        assert!(!cb.is_available());
        assert!(cb.admit().is_err());

        cb.record_success();
        assert!(cb.is_available());
    }

    #[tokio::test]
    async fn test_execute_respects_context() {
        let cb = breaker(5, Duration::from_secs(30));
        let ctx = ExecutionContext::with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));

        let result: Result<()> = cb.execute(&ctx, || async { Ok(()) }).await;
        assert_eq!(result.unwrap_err().kind, crate::ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_thread_safety() {
        let cb = Arc::new(breaker(1000, Duration::from_secs(30)));
        let mut handles = vec![];
        for _ in 0..10 {
            let cb = Arc::clone(&cb);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    cb.record_failure();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().consecutive_failures, 500);
    }
}
