// ── In-flight request tracking ──
//
// Every callback-bearing request owns exactly one entry here until it is
// removed by a response, a timeout sweep, cancellation, or teardown.
// Removal happens under the lock; completion always runs after it is
// released, so completions may issue new requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{ErrorObject, RpcError};
use crate::jsonrpc::{INVALID_REQUEST_ID, RequestId};

/// Invoked with the `result` member of a successful response.
pub type SuccessCallback = Box<dyn FnOnce(Value) + Send>;
/// Invoked once when a request fails.
pub type ErrorCallback = Box<dyn FnOnce(RpcError) + Send>;

/// How a pending request reports its outcome.
pub enum Completion {
    Callbacks {
        on_success: SuccessCallback,
        on_error: Option<ErrorCallback>,
    },
    Channel(oneshot::Sender<Result<Value, RpcError>>),
}

impl Completion {
    fn complete(self, method: &str, outcome: Result<Value, RpcError>) {
        match (self, outcome) {
            (Self::Callbacks { on_success, .. }, Ok(value)) => on_success(value),
            (Self::Callbacks { on_error: Some(on_error), .. }, Err(err)) => on_error(err),
            (Self::Callbacks { on_error: None, .. }, Err(err)) => {
                warn!(method, error = %err, "request failed with no error handler");
            }
            (Self::Channel(tx), outcome) => {
                // Receiver gone means the caller stopped waiting.
                let _ = tx.send(outcome);
            }
        }
    }
}

pub struct PendingRequest {
    pub id: RequestId,
    pub method: String,
    pub created_at: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
    completion: Completion,
}

impl PendingRequest {
    fn complete(self, outcome: Result<Value, RpcError>) {
        self.completion.complete(&self.method, outcome);
    }
}

pub struct RequestRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request ID. IDs are never reused.
    pub fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a request under a freshly allocated ID.
    pub fn register(&self, method: &str, completion: Completion, timeout: Duration) -> RequestId {
        let id = self.next_id();
        let now = Instant::now();
        let request = PendingRequest {
            id,
            method: method.to_owned(),
            created_at: now,
            deadline: now + timeout,
            timeout,
            completion,
        };

        let mut pending = self.pending.lock();
        pending.insert(id, request);
        debug!(id, method, pending = pending.len(), "registered request");
        id
    }

    /// Route a response to its request. Returns `false` for unknown IDs.
    pub(crate) fn resolve(&self, id: RequestId, outcome: Result<Value, ErrorObject>) -> bool {
        if id == INVALID_REQUEST_ID {
            warn!("response carries the reserved request id 0");
            return false;
        }
        let Some(request) = self.pending.lock().remove(&id) else {
            trace!(id, "response for unknown or already-settled request dropped");
            return false;
        };

        let outcome = outcome.map_err(|object| {
            let err = RpcError::protocol(&request.method, object);
            warn!(id, method = %request.method, error = %err.message, "request rejected");
            err
        });
        request.complete(outcome);
        true
    }

    /// Forget a request without invoking anything.
    pub fn cancel(&self, id: RequestId) -> bool {
        if id == INVALID_REQUEST_ID {
            return false;
        }
        let removed = self.pending.lock().remove(&id);
        match removed {
            Some(request) => {
                debug!(id, method = %request.method, "request cancelled");
                // Dropped here: the callbacks never run.
                true
            }
            None => false,
        }
    }

    /// Expire every request whose deadline is at or before `now`.
    ///
    /// Error callbacks run in ascending ID order after the lock is released.
    pub fn process_timeouts(&self, now: Instant) -> usize {
        let mut expired: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .values()
                .filter(|request| request.deadline <= now)
                .map(|request| request.id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        expired.sort_by_key(|request| request.id);

        let count = expired.len();
        for request in expired {
            warn!(
                id = request.id,
                method = %request.method,
                elapsed_ms = u64::try_from(now.duration_since(request.created_at).as_millis())
                    .unwrap_or(u64::MAX),
                "request timed out"
            );
            let err = RpcError::timeout(&request.method, request.timeout);
            request.complete(Err(err));
        }
        count
    }

    /// Drop every pending request without invoking any callback.
    pub fn clear_silently(&self) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "discarded pending requests");
        }
        drained.len()
    }

    /// Fail every pending request with a `ConnectionLost` error.
    pub fn fail_all(&self) -> usize {
        let mut drained: Vec<PendingRequest> =
            self.pending.lock().drain().map(|(_, r)| r).collect();
        drained.sort_by_key(|request| request.id);

        let count = drained.len();
        if count > 0 {
            debug!(count, "failing pending requests after connection loss");
        }
        for request in drained {
            let err = RpcError::connection_lost(&request.method);
            request.complete(Err(err));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.lock().contains_key(&id)
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
