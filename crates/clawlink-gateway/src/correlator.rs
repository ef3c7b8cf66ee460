//! Request/response correlation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clawlink_core::ClientError;
use serde_json::Value;
use tokio::sync::oneshot;

/// How long a request may stay unanswered before it rejects.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingRequest {
    responder: oneshot::Sender<Result<Value, ClientError>>,
    created_at: Instant,
}

/// Tracks outstanding requests by id.
///
/// Ids are monotonically increasing and process-unique, so they are never
/// reused while outstanding. A pending entry is removed exactly once: by a
/// matching response, by its timeout, or by [`Correlator::reject_all`] on
/// connection loss - requests are never silently dropped.
#[derive(Default)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id and register a pending entry for it.
    ///
    /// The caller sends the frame and then awaits the receiver, normally
    /// under [`REQUEST_TIMEOUT`].
    pub fn register(&self) -> (String, oneshot::Receiver<Result<Value, ClientError>>) {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id.clone(),
            PendingRequest {
                responder: tx,
                created_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Settle the pending request with the given id.
    ///
    /// Returns false when no such request is outstanding - for example a
    /// response to an already-timed-out request - in which case the frame
    /// is discarded without any state change.
    pub fn settle(&self, id: &str, result: Result<Value, ClientError>) -> bool {
        let Some(entry) = self.pending.lock().unwrap().remove(id) else {
            return false;
        };
        let _ = entry.responder.send(result);
        true
    }

    /// Drop the pending entry after its timeout elapsed.
    pub fn forget(&self, id: &str) {
        if let Some(entry) = self.pending.lock().unwrap().remove(id) {
            tracing::debug!(
                id,
                elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                "request timed out"
            );
        }
    }

    /// Reject every outstanding request with [`ClientError::ConnectionLost`].
    pub fn reject_all(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "rejecting outstanding requests");
        }
        for entry in drained {
            let _ = entry.responder.send(Err(ClientError::ConnectionLost));
        }
    }

    /// Number of currently outstanding requests.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_unique_among_outstanding() {
        let correlator = Correlator::new();
        let ids: Vec<String> = (0..100).map(|_| correlator.register().0).collect();
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(correlator.outstanding(), 100);
    }

    #[tokio::test]
    async fn settle_resolves_matching_request() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        assert!(correlator.settle(&id, Ok(json!({"ok": true}))));
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn unmatched_response_is_a_no_op() {
        let correlator = Correlator::new();
        let (_id, _rx) = correlator.register();
        assert!(!correlator.settle("c999", Ok(Value::Null)));
        assert_eq!(correlator.outstanding(), 1);
    }

    #[tokio::test]
    async fn reject_all_empties_the_pending_set() {
        let correlator = Correlator::new();
        let receivers: Vec<_> = (0..3).map(|_| correlator.register().1).collect();
        correlator.reject_all();
        assert_eq!(correlator.outstanding(), 0);
        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, ClientError::ConnectionLost));
        }
    }
}
