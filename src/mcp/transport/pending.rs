//! In-flight request correlation.
//!
//! Every transport owns one [`PendingRequests`]. Ids are allocated from a
//! per-instance counter and never reused. Whoever removes an entry from the map
//! first (a response, the timeout, or a bulk rejection) decides the outcome; any
//! later attempt to resolve the same id is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::mcp::error::McpError;

type Completion = oneshot::Sender<Result<Value, McpError>>;

#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Completion>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Completion>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a fresh id and registers a completion slot for it.
    pub fn register(self: &Arc<Self>, method: &str) -> PendingResponse {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.entries().insert(id, tx);
        PendingResponse {
            id,
            method: method.to_string(),
            rx,
            pending: Arc::clone(self),
        }
    }

    /// Delivers an outcome to the request with the given id. Returns false when
    /// the id is unknown or was already resolved.
    pub fn resolve(&self, id: u64, outcome: Result<Value, McpError>) -> bool {
        let Some(tx) = self.entries().remove(&id) else {
            debug!(request_id = id, "Dropping MCP response for unknown request");
            return false;
        };
        tx.send(outcome).is_ok()
    }

    /// Removes an entry without resolving it.
    pub fn forget(&self, id: u64) {
        self.entries().remove(&id);
    }

    /// Rejects every outstanding request with the error produced by `reason`.
    pub fn reject_all(&self, reason: impl Fn() -> McpError) -> usize {
        let drained: Vec<_> = self.entries().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(reason()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The receiving half of a registered request.
pub struct PendingResponse {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<Value, McpError>>,
    pending: Arc<PendingRequests>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the matching response. On timeout the entry is removed so a
    /// late response is dropped instead of resolving a stale waiter.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value, McpError> {
        let outcome = tokio::time::timeout(timeout, &mut self.rx).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::Stopped),
            Err(_) => {
                self.pending.forget(self.id);
                debug!(request_id = self.id, method = %self.method, "MCP request timed out");
                Err(McpError::Timeout {
                    method: self.method.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    stderr: String::new(),
                })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // A cancelled waiter must not leave its slot behind.
        self.pending.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let pending = PendingRequests::new();
        let first = pending.register("a");
        let second = pending.register("b");
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        drop(first);
        let third = pending.register("c");
        assert_eq!(third.id(), 3);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_matching_waiters() {
        let pending = PendingRequests::new();
        let waiters: Vec<_> = (0..3).map(|_| pending.register("tools/call")).collect();
        let ids: Vec<u64> = waiters.iter().map(PendingResponse::id).collect();

        for id in ids.iter().rev() {
            assert!(pending.resolve(*id, Ok(json!({ "answer": id }))));
        }

        for waiter in waiters {
            let id = waiter.id();
            let value = waiter
                .wait(Duration::from_secs(1))
                .await
                .expect("response should arrive");
            assert_eq!(value, json!({ "answer": id }));
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn second_resolution_is_a_no_op() {
        let pending = PendingRequests::new();
        let waiter = pending.register("tools/list");
        let id = waiter.id();
        assert!(pending.resolve(id, Ok(json!(1))));
        assert!(!pending.resolve(id, Ok(json!(2))));
        let value = waiter.wait(Duration::from_secs(1)).await.expect("first wins");
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn timeout_only_affects_its_own_request() {
        let pending = PendingRequests::new();
        let slow = pending.register("slow");
        let fast = pending.register("fast");
        let fast_id = fast.id();

        let err = slow
            .wait(Duration::from_millis(20))
            .await
            .expect_err("slow request should time out");
        assert!(err.is_timeout());
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(fast_id, Ok(json!("ok"))));
        assert_eq!(
            fast.wait(Duration::from_secs(1)).await.expect("fast resolves"),
            json!("ok")
        );
    }

    #[tokio::test]
    async fn reject_all_fails_every_waiter() {
        let pending = PendingRequests::new();
        let a = pending.register("a");
        let b = pending.register("b");
        assert_eq!(pending.reject_all(|| McpError::Stopped), 2);
        assert!(matches!(
            a.wait(Duration::from_secs(1)).await,
            Err(McpError::Stopped)
        ));
        assert!(matches!(
            b.wait(Duration::from_secs(1)).await,
            Err(McpError::Stopped)
        ));
    }
}
