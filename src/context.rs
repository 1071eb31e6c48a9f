//! Execution context: cooperative cancellation, deadlines, keyed values.
//!
//! A context is a cheap, immutable handle. The deadline is a fixed point in
//! time computed at creation, not a live timer, so contexts can be cloned and
//! passed around freely and every clone observes the same deadline.
//!
//! Cancellation is cooperative: nothing in this crate preempts an in-flight
//! operation. Loops and long operations call [`ExecutionContext::check`] at
//! each iteration boundary; that is the only cancellation mechanism.

use crate::{ErrorContext, Result, VisionError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options for constructing an [`ExecutionContext`].
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Relative timeout; the absolute deadline is computed at construction.
    pub timeout: Option<Duration>,
    /// Arbitrary keyed values carried by the context (request ids, tenant
    /// tags, ...). Read-only after construction.
    pub values: HashMap<String, serde_json::Value>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

#[derive(Debug)]
struct Shared {
    deadline: Option<Instant>,
    cancelled: AtomicBool,
    values: HashMap<String, serde_json::Value>,
}

/// Immutable cancellation/deadline handle threaded through guarded calls.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    shared: Arc<Shared>,
}

impl ExecutionContext {
    /// Build a context from options, computing the absolute deadline now.
    pub fn new(options: ContextOptions) -> Self {
        let deadline = options.timeout.map(|t| Instant::now() + t);
        Self {
            shared: Arc::new(Shared {
                deadline,
                cancelled: AtomicBool::new(false),
                values: options.values,
            }),
        }
    }

    /// Context with no deadline and no values.
    pub fn background() -> Self {
        Self::new(ContextOptions::new())
    }

    /// Context with a relative timeout and no values.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(ContextOptions::new().with_timeout(timeout))
    }

    /// Request cooperative cancellation. All clones observe the flag.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once the deadline has passed or cancellation was requested.
    ///
    /// Pure and allocation-free; safe to call at every iteration boundary.
    pub fn is_done(&self) -> bool {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.shared.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Returns `Err(DeadlineExceeded)` once the context is done, else `Ok`.
    pub fn check(&self) -> Result<()> {
        if self.is_done() {
            let message = if self.shared.cancelled.load(Ordering::SeqCst) {
                "context cancelled"
            } else {
                "context deadline exceeded"
            };
            return Err(VisionError::deadline_exceeded(message)
                .with_context(ErrorContext::new().with_source("execution_context")));
        }
        Ok(())
    }

    /// The absolute deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// Time left before the deadline. `None` when no deadline was set;
    /// `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.shared
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Look up a keyed value attached at construction.
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.shared.values.get(key)
    }
}
