//! Error model for the execution core.
//!
//! Every fallible operation in this crate returns [`crate::Result`] instead of
//! panicking or signaling failure out of band. Errors carry a closed
//! [`ErrorKind`] taxonomy plus a structured [`ErrorContext`] so callers can
//! classify failures (retry? fall back? give up?) without string matching.
//!
//! ## Error Kind Taxonomy
//!
//! | Kind | Meaning | Recovery |
//! |------|---------|----------|
//! | `RateLimited` | local token bucket exhausted | retry after backoff |
//! | `Timeout` | a guarded operation exceeded its bound | retry or fallback |
//! | `DeadlineExceeded` | the governing context expired or was cancelled | give up |
//! | `ProviderError` | the guarded operation itself failed | retry or fallback |
//! | `ProviderUnavailable` | no eligible backend remained | terminal for the call |
//! | `CircuitOpen` | fail-fast short circuit | wait for reset or fall back |

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Closed set of failure codes used across the execution core.
///
/// Matching on this enum is exhaustive, so adding a variant is a breaking
/// change by design: call sites must decide how to handle every failure
/// class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The local token bucket had no whole token available.
    RateLimited,
    /// A guarded operation ran past its per-call bound.
    Timeout,
    /// The governing [`ExecutionContext`](crate::context::ExecutionContext)
    /// passed its deadline or was cancelled.
    DeadlineExceeded,
    /// The guarded operation returned a failure of its own.
    ProviderError,
    /// Every candidate backend was exhausted or ineligible.
    ProviderUnavailable,
    /// A circuit breaker rejected the call without invoking the operation.
    CircuitOpen,
}

impl ErrorKind {
    /// Returns the canonical code string (e.g. `"RATE_LIMITED"`).
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::Timeout => "TIMEOUT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    /// Returns whether a failure of this kind is worth retrying in place.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::ProviderError)
    }

    /// Returns whether a failure of this kind should trigger a fallback to
    /// another backend rather than a local retry.
    #[inline]
    pub fn fallbackable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::ProviderError | Self::CircuitOpen
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error context for classification and debugging.
///
/// The `retry_after_ms` hint, when present, overrides computed backoff in
/// [`with_retry`](crate::resilience::retry::with_retry).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    /// Component that produced the error (e.g. `"rate_limiter"`, `"fallback_chain"`).
    pub source: Option<String>,
    /// Additional human-oriented detail.
    pub details: Option<String>,
    /// Suggested minimum wait before the next attempt.
    pub retry_after_ms: Option<u64>,
    /// Free-form keyed payload (attempted backends, counters, ...).
    pub values: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// Unified error type for the execution core.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}: {message}{}", format_context(.context))]
pub struct VisionError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ms) = ctx.retry_after_ms {
        parts.push(format!("retry_after_ms: {}", ms));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl VisionError {
    /// Create a new error with an empty context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Attach structured context, replacing any existing one.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn provider_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderError, message)
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderUnavailable, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    /// The `retry_after_ms` hint, if the producer attached one.
    #[inline]
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.context.retry_after_ms
    }

    #[inline]
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    #[inline]
    pub fn fallbackable(&self) -> bool {
        self.kind.fallbackable()
    }
}
