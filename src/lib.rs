//! # vision-core
//!
//! Fault-tolerant execution core for calls to unreliable, rate-limited,
//! sometimes-down remote backends (LLM providers and similar). It makes
//! those calls safe, bounded, and observable; everything else — routing,
//! persistence, billing, UI — lives outside and consumes this crate
//! in-process.
//!
//! ## Core Philosophy
//!
//! - **Results, not panics**: every fallible operation returns [`Result`]
//!   with a closed [`ErrorKind`] taxonomy.
//! - **Lazy time**: token refill and circuit resets are evaluated when
//!   checked, never by background timers.
//! - **Cooperative cancellation**: an [`ExecutionContext`] deadline is a
//!   value, not a live timer; callers poll it at iteration boundaries.
//! - **Owned instances**: limiters, breakers, and chains are constructed
//!   and shared explicitly, one per logical backend.
//!
//! ## Key Features
//!
//! - **Rate limiting**: token bucket via [`resilience::rate_limiter`]
//! - **Failure isolation**: circuit breaker via [`resilience::circuit_breaker`]
//! - **Request coalescing**: deduplication via [`resilience::dedup`]
//! - **Retry**: exponential backoff via [`resilience::retry`]
//! - **Graceful degradation**: health-aware fallback via [`resilience::fallback`]
//! - **Observability**: typed success/failure events via [`telemetry`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vision_core::resilience::fallback::{FallbackChain, FallbackOptions};
//! use vision_core::{ExecutionContext, VisionError};
//!
//! #[tokio::main]
//! async fn main() -> vision_core::Result<()> {
//!     let chain = FallbackChain::new("chat")
//!         .add("anthropic", || async { Ok("claude says hi".to_string()) },
//!             FallbackOptions::new().with_timeout(Duration::from_secs(20)))
//!         .add("openai", || async { Err(VisionError::provider_error("down")) },
//!             FallbackOptions::new());
//!
//!     let ctx = ExecutionContext::with_timeout(Duration::from_secs(30));
//!     let answer = chain.execute(&ctx).await?;
//!     println!("{} (from {})", answer.value, answer.source);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | `VisionError`, `ErrorKind`, `ErrorContext` |
//! | [`result`] | `collect` / `partition` combinators |
//! | [`context`] | Cancellation and deadline handle |
//! | [`resilience`] | Rate limiter, circuit breaker, dedup, retry, fallback |
//! | [`telemetry`] | Metrics event types and sink trait |

pub mod context;
pub mod error;
pub mod resilience;
pub mod result;
pub mod telemetry;

// Re-export main types for convenience
pub use context::{ContextOptions, ExecutionContext};
pub use error::{ErrorContext, ErrorKind, VisionError};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use resilience::dedup::RequestDeduplicator;
pub use resilience::fallback::{ChainResult, DegradationLevel, FallbackChain, FallbackOptions};
pub use resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
pub use resilience::retry::{with_retry, RetryConfig};
pub use result::{collect, partition, Partitioned};
pub use telemetry::{FailureEvent, MetricsSink, SuccessEvent};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, VisionError>;
