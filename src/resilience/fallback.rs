//! Health-aware fallback chain.
//!
//! A chain tries an ordered list of named backends, most-healthy first, and
//! stops at the first success. Entry ordering is recomputed from health
//! scores on every `execute` call, so the chain self-heals as backends
//! recover. Each entry carries its own coarse circuit: after a configurable
//! failure streak the entry is skipped for a reset window (unless marked
//! always-available).
//!
//! Health scores combine success rate, recency, latency, failure streak, and
//! circuit state into a 0-100 number; see [`FallbackChain::health_report`].
//! How far down the registration order an answer came from is reported as a
//! [`DegradationLevel`].

use crate::context::ExecutionContext;
use crate::telemetry::{new_trace_id, FailureEvent, MetricsSink, NoopMetricsSink, SuccessEvent};
use crate::{ErrorContext, ErrorKind, Result, VisionError};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Type-erased fallback operation. Each invocation produces a fresh future.
pub type Operation<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Per-entry registration options.
#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Attempt this entry even while its circuit is open (last-resort tiers).
    pub always_available: bool,
    /// Per-attempt bound; exceeding it counts as a failure.
    pub timeout: Duration,
    /// Multiplier applied to the computed health score.
    pub weight: f64,
    /// Forwarded as labels on emitted metrics events.
    pub tags: Vec<String>,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            always_available: false,
            timeout: Duration::from_secs(10),
            weight: 1.0,
            tags: Vec::new(),
        }
    }
}

impl FallbackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_always_available(mut self, always: bool) -> Self {
        self.always_available = always;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Chain-wide tuning. The per-entry circuit threshold and reset window are
/// deliberately separate knobs from any standalone
/// [`CircuitBreaker`](crate::resilience::circuit_breaker::CircuitBreaker)
/// guarding the same backend.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub entry_failure_threshold: u32,
    pub entry_reset_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            entry_failure_threshold: 5,
            entry_reset_timeout: Duration::from_secs(30),
        }
    }
}

impl ChainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry_failure_threshold(mut self, threshold: u32) -> Self {
        self.entry_failure_threshold = threshold;
        self
    }

    pub fn with_entry_reset_timeout(mut self, timeout: Duration) -> Self {
        self.entry_reset_timeout = timeout;
        self
    }
}

/// How far down the chain an answer came from, or how degraded the chain as
/// a whole is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    None,
    Partial,
    Severe,
    Emergency,
}

impl DegradationLevel {
    /// Level for an answer sourced from the entry at `index` in registration
    /// order.
    fn for_position(index: usize) -> Self {
        match index {
            0 => Self::None,
            1 => Self::Partial,
            2 => Self::Severe,
            _ => Self::Emergency,
        }
    }

    /// Level for a chain where `fraction` of entries are healthy.
    fn for_healthy_fraction(fraction: f64) -> Self {
        if fraction >= 0.8 {
            Self::None
        } else if fraction >= 0.5 {
            Self::Partial
        } else if fraction >= 0.2 {
            Self::Severe
        } else {
            Self::Emergency
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Partial => "partial",
            Self::Severe => "severe",
            Self::Emergency => "emergency",
        }
    }
}

/// Successful chain execution, with its audit trail.
#[derive(Debug, Clone)]
pub struct ChainResult<T> {
    pub value: T,
    /// Name of the entry that answered.
    pub source: String,
    /// Registration index of the answering entry.
    pub source_index: usize,
    /// Wall-clock time for the whole chain call, all attempts included.
    pub elapsed: Duration,
    /// Entries actually invoked, in attempt order, the answering one last.
    pub fallbacks_attempted: Vec<String>,
    pub degradation_level: DegradationLevel,
}

/// Mutable health record owned by the chain; mutated only through the
/// chain's own methods.
#[derive(Debug, Clone, Default)]
struct EntryHealth {
    successes: u64,
    failures: u64,
    total_latency: Duration,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    circuit_open: bool,
    circuit_opened_at: Option<Instant>,
}

impl EntryHealth {
    /// Open means: flagged open and still inside the reset window.
    fn circuit_open_at(&self, now: Instant, reset_timeout: Duration) -> bool {
        self.circuit_open
            && self
                .circuit_opened_at
                .map(|at| now.duration_since(at) < reset_timeout)
                .unwrap_or(false)
    }

    fn average_latency_ms(&self) -> Option<u64> {
        if self.successes == 0 {
            return None;
        }
        Some((self.total_latency.as_millis() as u64) / self.successes)
    }
}

struct FallbackEntry<T> {
    name: String,
    operation: Operation<T>,
    options: FallbackOptions,
    health: EntryHealth,
}

/// Per-entry view in a [`ChainHealthReport`].
#[derive(Debug, Clone, Serialize)]
pub struct EntryHealthReport {
    pub name: String,
    pub score: f64,
    pub is_healthy: bool,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub average_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainHealthReport {
    pub chain: String,
    pub degradation_level: DegradationLevel,
    pub entries: Vec<EntryHealthReport>,
    pub recommendation: String,
}

/// Ordered set of named fallback operations with per-entry health tracking.
///
/// One shared instance per logical capability; the chain owns all entry
/// health records for its lifetime.
pub struct FallbackChain<T> {
    name: String,
    config: ChainConfig,
    entries: Mutex<Vec<FallbackEntry<T>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> FallbackChain<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ChainConfig::default(),
            entries: Mutex::new(Vec::new()),
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    pub fn with_config(mut self, config: ChainConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register a fallback entry. Registration order defines degradation
    /// levels: index 0 is the primary.
    pub fn add<F, Fut>(self, name: impl Into<String>, operation: F, options: FallbackOptions) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let operation: Operation<T> =
            Arc::new(move || -> BoxFuture<'static, Result<T>> { Box::pin(operation()) });
        {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.push(FallbackEntry {
                name: name.into(),
                operation,
                options,
                health: EntryHealth::default(),
            });
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Health score in [0, 100]. Base 50, up to +30 for success rate, +10/+5
    /// for a success in the last 1/5 minutes, -10/-5 for average latency over
    /// 5s/2s, -5 per consecutive failure, -20 for an open circuit, scaled by
    /// weight, +5 for always-available.
    fn score(entry: &FallbackEntry<T>, config: &ChainConfig, now: Instant) -> f64 {
        let health = &entry.health;
        let mut score = 50.0;

        let total = health.successes + health.failures;
        if total > 0 {
            score += 30.0 * (health.successes as f64 / total as f64);
        }

        if let Some(last) = health.last_success {
            let age = now.duration_since(last);
            if age <= Duration::from_secs(60) {
                score += 10.0;
            } else if age <= Duration::from_secs(300) {
                score += 5.0;
            }
        }

        if let Some(avg_ms) = health.average_latency_ms() {
            if avg_ms > 5000 {
                score -= 10.0;
            } else if avg_ms > 2000 {
                score -= 5.0;
            }
        }

        score -= 5.0 * health.consecutive_failures as f64;

        if health.circuit_open_at(now, config.entry_reset_timeout) {
            score -= 20.0;
        }

        score *= entry.options.weight;
        if entry.options.always_available {
            score += 5.0;
        }

        score.clamp(0.0, 100.0)
    }

    /// Try entries most-healthy first, stopping at the first success.
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<ChainResult<T>> {
        ctx.check()?;
        let started = Instant::now();
        let trace_id = new_trace_id();

        // Snapshot candidates in health order. Scores are recomputed on every
        // call rather than cached.
        struct Candidate<T> {
            index: usize,
            name: String,
            operation: Operation<T>,
            timeout: Duration,
            skip: bool,
            tags: Vec<String>,
        }

        let candidates: Vec<Candidate<T>> = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            if entries.is_empty() {
                return Err(VisionError::provider_unavailable(format!(
                    "fallback chain '{}' has no entries",
                    self.name
                ))
                .with_context(ErrorContext::new().with_source("fallback_chain")));
            }
            let now = Instant::now();
            let mut scored: Vec<(usize, f64)> = entries
                .iter()
                .enumerate()
                .map(|(index, entry)| (index, Self::score(entry, &self.config, now)))
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));

            scored
                .into_iter()
                .map(|(index, _)| {
                    let entry = &entries[index];
                    Candidate {
                        index,
                        name: entry.name.clone(),
                        operation: Arc::clone(&entry.operation),
                        timeout: entry.options.timeout,
                        skip: entry.health.circuit_open_at(now, self.config.entry_reset_timeout)
                            && !entry.options.always_available,
                        tags: entry.options.tags.clone(),
                    }
                })
                .collect()
        };

        let mut attempted: Vec<String> = Vec::new();
        let mut attempts: u32 = 0;

        for candidate in candidates {
            if candidate.skip {
                debug!(
                    chain = self.name.as_str(),
                    entry = candidate.name.as_str(),
                    "skipping entry with open circuit"
                );
                continue;
            }
            ctx.check()?;

            attempts += 1;
            attempted.push(candidate.name.clone());
            let attempt_start = Instant::now();

            let outcome = match tokio::time::timeout(candidate.timeout, (candidate.operation)()).await
            {
                Ok(result) => result,
                Err(_) => Err(VisionError::timeout(format!(
                    "backend '{}' timed out after {}ms",
                    candidate.name,
                    candidate.timeout.as_millis()
                ))
                .with_context(ErrorContext::new().with_source("fallback_chain"))),
            };

            match outcome {
                Ok(value) => {
                    let latency = attempt_start.elapsed();
                    self.record_success(candidate.index, latency);

                    let elapsed = started.elapsed();
                    let degradation_level = DegradationLevel::for_position(candidate.index);
                    info!(
                        chain = self.name.as_str(),
                        source = candidate.name.as_str(),
                        degradation = degradation_level.as_str(),
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "fallback chain answered"
                    );
                    self.metrics
                        .emit_success(SuccessEvent {
                            operation: self.name.clone(),
                            attempts,
                            elapsed_ms: elapsed.as_millis() as u64,
                            from_fallback: candidate.index > 0,
                            labels: Self::labels(&candidate.name, &candidate.tags),
                            trace_id: trace_id.clone(),
                        })
                        .await;

                    return Ok(ChainResult {
                        value,
                        source: candidate.name,
                        source_index: candidate.index,
                        elapsed,
                        fallbacks_attempted: attempted,
                        degradation_level,
                    });
                }
                Err(err) => {
                    warn!(
                        chain = self.name.as_str(),
                        entry = candidate.name.as_str(),
                        error = %err,
                        "fallback entry failed"
                    );
                    self.record_failure(candidate.index);
                }
            }
        }

        let elapsed = started.elapsed();
        let message = if attempted.is_empty() {
            format!("fallback chain '{}' has no eligible entries", self.name)
        } else {
            format!(
                "all fallbacks exhausted for '{}': {}",
                self.name,
                attempted.join(", ")
            )
        };
        let err = VisionError::provider_unavailable(message).with_context(
            ErrorContext::new()
                .with_source("fallback_chain")
                .with_value("attempted", serde_json::json!(attempted)),
        );
        self.metrics
            .emit_failure(FailureEvent {
                operation: self.name.clone(),
                attempts,
                elapsed_ms: elapsed.as_millis() as u64,
                error_code: ErrorKind::ProviderUnavailable,
                error_message: err.message.clone(),
                labels: HashMap::new(),
                trace_id,
            })
            .await;
        Err(err)
    }

    fn labels(source: &str, tags: &[String]) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("source".to_string(), source.to_string());
        if !tags.is_empty() {
            labels.insert("tags".to_string(), tags.join(","));
        }
        labels
    }

    fn record_success(&self, index: usize, latency: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = entries.get_mut(index) {
            let health = &mut entry.health;
            health.successes += 1;
            health.total_latency += latency;
            health.last_success = Some(Instant::now());
            health.consecutive_failures = 0;
            health.circuit_open = false;
            health.circuit_opened_at = None;
        }
    }

    fn record_failure(&self, index: usize) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = entries.get_mut(index) {
            let health = &mut entry.health;
            health.failures += 1;
            health.last_failure = Some(Instant::now());
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            if health.consecutive_failures >= self.config.entry_failure_threshold {
                health.circuit_open = true;
                health.circuit_opened_at = Some(Instant::now());
                warn!(
                    chain = self.name.as_str(),
                    entry = entry.name.as_str(),
                    consecutive_failures = health.consecutive_failures,
                    reset_timeout_ms = self.config.entry_reset_timeout.as_millis() as u64,
                    "entry circuit opened"
                );
            }
        }
    }

    /// Per-entry scores plus an overall degradation level derived from the
    /// fraction of healthy entries.
    pub fn health_report(&self) -> ChainHealthReport {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();

        let reports: Vec<EntryHealthReport> = entries
            .iter()
            .map(|entry| {
                let score = Self::score(entry, &self.config, now);
                let circuit_open = entry
                    .health
                    .circuit_open_at(now, self.config.entry_reset_timeout);
                EntryHealthReport {
                    name: entry.name.clone(),
                    score,
                    is_healthy: score >= 40.0 && !circuit_open,
                    successes: entry.health.successes,
                    failures: entry.health.failures,
                    consecutive_failures: entry.health.consecutive_failures,
                    circuit_open,
                    average_latency_ms: entry.health.average_latency_ms(),
                }
            })
            .collect();

        let healthy = reports.iter().filter(|r| r.is_healthy).count();
        let fraction = if reports.is_empty() {
            0.0
        } else {
            healthy as f64 / reports.len() as f64
        };
        let degradation_level = DegradationLevel::for_healthy_fraction(fraction);
        let recommendation = match degradation_level {
            DegradationLevel::None => "all backends healthy".to_string(),
            DegradationLevel::Partial => {
                "some backends degraded; monitor error rates".to_string()
            }
            DegradationLevel::Severe => {
                "most backends unhealthy; expect degraded answers".to_string()
            }
            DegradationLevel::Emergency => {
                "no healthy backends; investigate provider status immediately".to_string()
            }
        };

        ChainHealthReport {
            chain: self.name.clone(),
            degradation_level,
            entries: reports,
            recommendation,
        }
    }

    /// Operational override: clear an entry's failure streak and circuit.
    /// Returns false when no entry has that name.
    pub fn mark_healthy(&self, name: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.health.consecutive_failures = 0;
                entry.health.circuit_open = false;
                entry.health.circuit_opened_at = None;
                entry.health.last_success = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Operational override: open an entry's circuit as if its failure
    /// threshold had been reached. Returns false when no entry has that name.
    pub fn mark_unhealthy(&self, name: &str) -> bool {
        let threshold = self.config.entry_failure_threshold;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.health.consecutive_failures = threshold;
                entry.health.circuit_open = true;
                entry.health.circuit_opened_at = Some(Instant::now());
                entry.health.last_failure = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Reset every entry's health record to a fresh state.
    pub fn reset_health(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        for entry in entries.iter_mut() {
            entry.health = EntryHealth::default();
        }
    }
}
