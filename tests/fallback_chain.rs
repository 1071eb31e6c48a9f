//! Fallback-chain scenarios across real circuit breakers and health state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vision_core::resilience::fallback::ChainConfig;
use vision_core::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, DegradationLevel, ExecutionContext,
    FallbackChain, FallbackOptions, VisionError,
};

/// A chain over two backends where the primary's breaker was forced open by
/// two prior failures: the chain must answer from the fallback without
/// invoking the primary's operation.
#[tokio::test]
async fn test_open_primary_breaker_routes_to_fallback() {
    let ctx = ExecutionContext::with_timeout(Duration::from_secs(10));

    let anthropic_breaker = Arc::new(CircuitBreaker::new(
        "anthropic",
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_reset_timeout(Duration::from_secs(30)),
    ));

    // Two failures force the primary's breaker open.
    for _ in 0..2 {
        let result: vision_core::Result<String> = anthropic_breaker
            .execute(&ctx, || async {
                Err(VisionError::provider_error("overloaded"))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(anthropic_breaker.state(), CircuitState::Open);

    let anthropic_calls = Arc::new(AtomicU32::new(0));
    let chain = {
        let anthropic_breaker = Arc::clone(&anthropic_breaker);
        let anthropic_calls = Arc::clone(&anthropic_calls);
        let ctx_for_entry = ctx.clone();
        FallbackChain::new("chat")
            .add(
                "anthropic",
                move || {
                    let breaker = Arc::clone(&anthropic_breaker);
                    let calls = Arc::clone(&anthropic_calls);
                    let ctx = ctx_for_entry.clone();
                    async move {
                        breaker
                            .execute(&ctx, move || async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                Ok("claude response".to_string())
                            })
                            .await
                    }
                },
                FallbackOptions::new(),
            )
            .add(
                "openai-fallback",
                || async { Ok("gpt response".to_string()) },
                FallbackOptions::new(),
            )
    };

    let result = chain.execute(&ctx).await.unwrap();
    assert_eq!(result.source, "openai-fallback");
    assert_eq!(result.value, "gpt response");
    assert_eq!(result.source_index, 1);
    assert_eq!(result.degradation_level, DegradationLevel::Partial);
    // The open breaker short-circuited: the guarded operation never ran.
    assert_eq!(anthropic_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        result.fallbacks_attempted,
        vec!["anthropic".to_string(), "openai-fallback".to_string()]
    );
}

/// Exhaustion reports every attempted backend in order.
#[tokio::test]
async fn test_full_exhaustion_lists_every_backend() {
    let chain: FallbackChain<String> = FallbackChain::new("chat")
        .add(
            "anthropic",
            || async { Err(VisionError::provider_error("500")) },
            FallbackOptions::new(),
        )
        .add(
            "openai",
            || async { Err(VisionError::timeout("slow")) },
            FallbackOptions::new(),
        )
        .add(
            "local-model",
            || async { Err(VisionError::provider_error("OOM")) },
            FallbackOptions::new(),
        );

    let err = chain
        .execute(&ExecutionContext::background())
        .await
        .unwrap_err();
    assert_eq!(err.kind, vision_core::ErrorKind::ProviderUnavailable);
    assert_eq!(
        err.context.values.get("attempted"),
        Some(&serde_json::json!(["anthropic", "openai", "local-model"]))
    );
}

/// An answer from the fourth registered tier reports emergency degradation.
#[tokio::test]
async fn test_deep_fallback_is_emergency() {
    let opts = || FallbackOptions::new().with_timeout(Duration::from_secs(1));
    let chain = FallbackChain::new("chat")
        .add("a", || async { Err(VisionError::provider_error("down")) }, opts())
        .add("b", || async { Err(VisionError::provider_error("down")) }, opts())
        .add("c", || async { Err(VisionError::provider_error("down")) }, opts())
        .add("d", || async { Ok("static template".to_string()) }, opts());

    let result = chain.execute(&ExecutionContext::background()).await.unwrap();
    assert_eq!(result.source, "d");
    assert_eq!(result.source_index, 3);
    assert_eq!(result.degradation_level, DegradationLevel::Emergency);
    assert_eq!(result.fallbacks_attempted.len(), 4);
}

/// The chain self-heals: once a previously failing entry recovers and is
/// marked healthy again, later calls prefer it by score.
#[tokio::test]
async fn test_chain_recovers_after_reset() {
    let primary_ok = Arc::new(AtomicU32::new(0)); // 0 = failing, 1 = healthy
    let chain = {
        let primary_ok = Arc::clone(&primary_ok);
        FallbackChain::new("chat")
            .with_config(ChainConfig::new().with_entry_failure_threshold(2))
            .add(
                "primary",
                move || {
                    let ok = Arc::clone(&primary_ok);
                    async move {
                        if ok.load(Ordering::SeqCst) == 1 {
                            Ok("primary".to_string())
                        } else {
                            Err(VisionError::provider_error("down"))
                        }
                    }
                },
                FallbackOptions::new(),
            )
            .add(
                "backup",
                || async { Ok("backup".to_string()) },
                FallbackOptions::new(),
            )
    };
    let ctx = ExecutionContext::background();

    let first = chain.execute(&ctx).await.unwrap();
    assert_eq!(first.source, "backup");

    // Backend recovers; clear its record so scoring reflects reality again.
    primary_ok.store(1, Ordering::SeqCst);
    chain.reset_health();

    let healed = chain.execute(&ctx).await.unwrap();
    assert_eq!(healed.source, "primary");
    assert_eq!(healed.degradation_level, DegradationLevel::None);
}

/// Health report mirrors manual overrides and drives the chain level.
#[tokio::test]
async fn test_health_report_reflects_overrides() {
    let chain = FallbackChain::new("chat")
        .add("a", || async { Ok(()) }, FallbackOptions::new())
        .add("b", || async { Ok(()) }, FallbackOptions::new())
        .add("c", || async { Ok(()) }, FallbackOptions::new())
        .add("d", || async { Ok(()) }, FallbackOptions::new());

    assert_eq!(
        chain.health_report().degradation_level,
        DegradationLevel::None
    );

    chain.mark_unhealthy("a");
    chain.mark_unhealthy("b");
    // 2 of 4 healthy.
    assert_eq!(
        chain.health_report().degradation_level,
        DegradationLevel::Partial
    );

    chain.mark_unhealthy("c");
    // 1 of 4 healthy.
    assert_eq!(
        chain.health_report().degradation_level,
        DegradationLevel::Severe
    );

    chain.mark_healthy("a");
    chain.mark_healthy("b");
    chain.mark_healthy("c");
    assert_eq!(
        chain.health_report().degradation_level,
        DegradationLevel::None
    );
}
