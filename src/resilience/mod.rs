//! Resilience primitives: the guards between callers and unreliable backends.
//!
//! Each primitive is an explicitly constructed, explicitly owned instance
//! shared per logical backend (constructor injection, no hidden globals).
//! They compose freely: a typical call path is rate limit, then dedup, then
//! circuit breaker, with [`fallback::FallbackChain`] as the outermost tier
//! switch and [`retry::with_retry`] wrapping whichever layer should be
//! retried.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Token bucket with lazy refill |
//! | [`circuit_breaker`] | Per-backend fail-fast state machine |
//! | [`dedup`] | In-flight request coalescing |
//! | [`retry`] | Bounded retry with exponential backoff |
//! | [`fallback`] | Health-aware ordered fallback chain |
//!
//! None of these spawn background tasks: refill, circuit reset, and health
//! decay are all evaluated lazily at call sites, so timing behavior is fully
//! determined by the calls the application makes.

pub mod circuit_breaker;
pub mod dedup;
pub mod fallback;
pub mod rate_limiter;
pub mod retry;
