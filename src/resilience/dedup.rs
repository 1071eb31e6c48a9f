//! Request deduplication (in-flight coalescing).
//!
//! Concurrent calls sharing a key are merged into one underlying invocation:
//! the first caller becomes the leader and runs the operation, later callers
//! attach as waiters and receive a clone of the same settled result, success
//! or failure alike. Entries are removed from the map synchronously at
//! settlement, before the broadcast, so a subsequent call with the same key
//! always triggers a fresh invocation.
//!
//! Keys are caller-chosen and must uniquely identify "the same logical
//! request" for coalescing to be correct.

use crate::context::ExecutionContext;
use crate::{ErrorContext, Result, VisionError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Counters maintained across the deduplicator's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DedupStats {
    /// Every `execute` call.
    pub total_requests: u64,
    /// Calls that attached to an existing in-flight entry.
    pub deduplicated_requests: u64,
    /// Calls that led an underlying invocation.
    pub executed_requests: u64,
    /// Entries currently in flight.
    pub in_flight: u64,
}

type InflightMap<T> = HashMap<String, broadcast::Sender<Result<T>>>;

/// Coalesces concurrent identical requests into one underlying call.
pub struct RequestDeduplicator<T: Clone> {
    inflight: Arc<Mutex<InflightMap<T>>>,
    total_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    executed_requests: AtomicU64,
}

impl<T: Clone> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> RequestDeduplicator<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            total_requests: AtomicU64::new(0),
            deduplicated_requests: AtomicU64::new(0),
            executed_requests: AtomicU64::new(0),
        }
    }

    /// Execute `op` under `key`, coalescing with any in-flight call for the
    /// same key.
    ///
    /// For N concurrent calls sharing a key, exactly one invocation of `op`
    /// occurs; all N callers receive an equal result.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &ExecutionContext,
        key: impl Into<String>,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        ctx.check()?;
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let key = key.into();

        // Attach or become the leader. The guard is never held across an await.
        let waiter = {
            let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match map.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    map.insert(key.clone(), tx);
                    None
                }
            }
        };

        match waiter {
            Some(mut rx) => {
                self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
                debug!(key = key.as_str(), "attached to in-flight request");
                match rx.recv().await {
                    Ok(result) => result,
                    // The leader's future was dropped before settling.
                    Err(_) => Err(VisionError::provider_error(
                        "deduplicated request abandoned before settling",
                    )
                    .with_context(
                        ErrorContext::new()
                            .with_source("request_deduplicator")
                            .with_value("key", serde_json::json!(key)),
                    )),
                }
            }
            None => {
                self.executed_requests.fetch_add(1, Ordering::Relaxed);
                let cleanup = EntryGuard {
                    inflight: Arc::clone(&self.inflight),
                    key: key.clone(),
                    armed: true,
                };

                let result = op().await;

                // Settle: remove the entry before broadcasting so a new call
                // with this key starts a fresh invocation.
                let tx = {
                    let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
                    map.remove(&key)
                };
                cleanup.disarm();
                if let Some(tx) = tx {
                    // No waiters attached is fine; the send result is unused.
                    let _ = tx.send(result.clone());
                }
                result
            }
        }
    }

    pub fn stats(&self) -> DedupStats {
        let in_flight = self
            .inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len() as u64;
        DedupStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// Removes the in-flight entry if the leader is dropped without settling,
/// which closes the channel and fails attached waiters instead of hanging
/// them.
struct EntryGuard<T: Clone> {
    inflight: Arc<Mutex<InflightMap<T>>>,
    key: String,
    armed: bool,
}

impl<T: Clone> EntryGuard<T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Clone> Drop for EntryGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            map.remove(&self.key);
        }
    }
}
