//! Observability boundary: metrics events emitted by the execution core.
//!
//! The core does not implement metrics storage or export. It emits typed
//! success/failure events through the [`MetricsSink`] trait and an external
//! collaborator decides what to do with them. Sinks are injected where they
//! are consumed (constructor injection); there is no global registry.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MetricsSink`] | Trait for event destinations |
//! | [`NoopMetricsSink`] | Default no-op sink (no collection) |
//! | [`InMemoryMetricsSink`] | Bounded in-memory sink for testing |
//! | [`TracingMetricsSink`] | Structured log line per event |

use crate::ErrorKind;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Generate a fresh trace identifier for one emitted event.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A call that ultimately succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessEvent {
    pub operation: String,
    /// Number of backend attempts the call consumed.
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// True when the answer came from anywhere but the primary backend.
    pub from_fallback: bool,
    pub labels: HashMap<String, String>,
    pub trace_id: String,
}

/// A call that ultimately failed.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEvent {
    pub operation: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub error_code: ErrorKind,
    pub error_message: String,
    pub labels: HashMap<String, String>,
    pub trace_id: String,
}

/// Either event, for sinks that store a unified stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MetricEvent {
    Success(SuccessEvent),
    Failure(FailureEvent),
}

/// Destination for metrics events. Implementations must be cheap or
/// internally buffered; emitters do not handle sink backpressure.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn emit_success(&self, event: SuccessEvent);
    async fn emit_failure(&self, event: FailureEvent);
}

/// Default sink: drops every event.
pub struct NoopMetricsSink;

#[async_trait]
impl MetricsSink for NoopMetricsSink {
    async fn emit_success(&self, _event: SuccessEvent) {}
    async fn emit_failure(&self, _event: FailureEvent) {}
}

/// Bounded in-memory sink for testing.
pub struct InMemoryMetricsSink {
    events: Arc<RwLock<Vec<MetricEvent>>>,
    max_events: usize,
}

impl InMemoryMetricsSink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }

    pub fn get_events(&self) -> Vec<MetricEvent> {
        self.events.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.write().unwrap().clear();
    }

    fn push(&self, event: MetricEvent) {
        let mut events = self.events.write().unwrap();
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn emit_success(&self, event: SuccessEvent) {
        self.push(MetricEvent::Success(event));
    }

    async fn emit_failure(&self, event: FailureEvent) {
        self.push(MetricEvent::Failure(event));
    }
}

/// Sink that logs one structured line per event.
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn emit_success(&self, event: SuccessEvent) {
        tracing::info!(
            operation = event.operation.as_str(),
            attempts = event.attempts,
            elapsed_ms = event.elapsed_ms,
            from_fallback = event.from_fallback,
            trace_id = event.trace_id.as_str(),
            "operation succeeded"
        );
    }

    async fn emit_failure(&self, event: FailureEvent) {
        tracing::warn!(
            operation = event.operation.as_str(),
            attempts = event.attempts,
            elapsed_ms = event.elapsed_ms,
            error_code = event.error_code.as_str(),
            error_message = event.error_message.as_str(),
            trace_id = event.trace_id.as_str(),
            "operation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(op: &str) -> SuccessEvent {
        SuccessEvent {
            operation: op.to_string(),
            attempts: 1,
            elapsed_ms: 12,
            from_fallback: false,
            labels: HashMap::new(),
            trace_id: new_trace_id(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_sink_records_events() {
        let sink = InMemoryMetricsSink::new(10);
        sink.emit_success(success("chat")).await;
        sink.emit_failure(FailureEvent {
            operation: "chat".to_string(),
            attempts: 3,
            elapsed_ms: 900,
            error_code: ErrorKind::ProviderUnavailable,
            error_message: "all backends failed".to_string(),
            labels: HashMap::new(),
            trace_id: new_trace_id(),
        })
        .await;

        let events = sink.get_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], MetricEvent::Success(_)));
        assert!(matches!(events[1], MetricEvent::Failure(_)));
    }

    #[tokio::test]
    async fn test_in_memory_sink_evicts_oldest() {
        let sink = InMemoryMetricsSink::new(2);
        for op in ["a", "b", "c"] {
            sink.emit_success(success(op)).await;
        }
        let events = sink.get_events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            MetricEvent::Success(e) => assert_eq!(e.operation, "b"),
            _ => panic!("expected success event"),
        }
    }

    #[test]
    fn test_trace_ids_are_unique() {
        assert_ne!(new_trace_id(), new_trace_id());
    }
}
