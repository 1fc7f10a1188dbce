//! Live pending table and response demultiplexing
//!
//! The table mutex is the single point of ownership for a request: whoever
//! removes an entry (the completing reply, or the caller giving up) resolves it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::envelope::{RequestId, ResponseEnvelope};
use crate::error::{FanoutError, FanoutResult};

/// Counters for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelatorMetrics {
    pub pending_requests: usize,
    pub requests_started: u64,
    pub requests_completed: u64,
    pub requests_timed_out: u64,
    pub replies_applied: u64,
    pub replies_dropped: u64,
}

/// What happened to an inbound reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demux {
    /// Recorded; other targets still outstanding
    Applied,
    /// Recorded and it was the last one; the waiter has been released
    Completed,
    /// No live request with that id (late, or never ours)
    UnknownRequest,
    /// Request is live but the responder is not (or no longer) owed a reply
    UnexpectedInstance,
}

struct PendingRequest {
    topic: String,
    outstanding: HashSet<u32>,
    collected: Vec<Value>,
    done: oneshot::Sender<Vec<Value>>,
}

#[derive(Default)]
struct TableState {
    requests: HashMap<RequestId, PendingRequest>,
    metrics: CorrelatorMetrics,
}

/// Requests waiting for remote replies, keyed by request id
///
/// Shared between the correlator (insert/expire) and the connection's
/// subscription pump (deliver).
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<TableState>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request owed one reply per target
    ///
    /// The receiver yields the collected replies once every target answered.
    pub fn insert(
        &self,
        request_id: RequestId,
        topic: &str,
        targets: impl IntoIterator<Item = u32>,
    ) -> FanoutResult<oneshot::Receiver<Vec<Value>>> {
        let outstanding: HashSet<u32> = targets.into_iter().collect();
        let (done, rx) = oneshot::channel();

        let mut state = self.lock();
        if state.requests.contains_key(&request_id) {
            return Err(FanoutError::DuplicateRequest(request_id.to_string()));
        }
        debug!(%request_id, %topic, targets = outstanding.len(), "PendingTable::insert");
        let capacity = outstanding.len();
        state.requests.insert(
            request_id,
            PendingRequest {
                topic: topic.to_string(),
                outstanding,
                collected: Vec::with_capacity(capacity),
                done,
            },
        );
        state.metrics.requests_started += 1;
        state.metrics.pending_requests = state.requests.len();
        Ok(rx)
    }

    /// Apply one reply to its pending request
    pub fn deliver(&self, response: ResponseEnvelope) -> Demux {
        let mut state = self.lock();
        let state = &mut *state;

        let Some(pending) = state.requests.get_mut(&response.request_id) else {
            debug!(request_id = %response.request_id, "PendingTable: dropping reply for unknown request");
            state.metrics.replies_dropped += 1;
            return Demux::UnknownRequest;
        };

        let owed = response.instance_id.is_some_and(|id| pending.outstanding.remove(&id));
        if !owed {
            warn!(
                request_id = %response.request_id,
                instance_id = ?response.instance_id,
                topic = %pending.topic,
                "PendingTable: dropping unexpected or duplicate reply"
            );
            state.metrics.replies_dropped += 1;
            return Demux::UnexpectedInstance;
        }

        pending.collected.push(response.message);
        state.metrics.replies_applied += 1;

        if !pending.outstanding.is_empty() {
            return Demux::Applied;
        }

        if let Some(pending) = state.requests.remove(&response.request_id) {
            debug!(request_id = %response.request_id, topic = %pending.topic, "PendingTable: request complete");
            // Waiter may already have given up; the entry is gone either way
            let _ = pending.done.send(pending.collected);
            state.metrics.requests_completed += 1;
            state.metrics.pending_requests = state.requests.len();
        }
        Demux::Completed
    }

    /// Remove a request that ran out of time
    ///
    /// Returns how many replies were still outstanding, or None if the entry
    /// was already gone (completed or never inserted).
    pub fn expire(&self, request_id: &RequestId) -> Option<usize> {
        let mut state = self.lock();
        let pending = state.requests.remove(request_id)?;
        warn!(%request_id, topic = %pending.topic, outstanding = pending.outstanding.len(), "PendingTable: request timed out");
        state.metrics.requests_timed_out += 1;
        state.metrics.pending_requests = state.requests.len();
        Some(pending.outstanding.len())
    }

    /// Remove a request without counting it as timed out
    pub fn remove(&self, request_id: &RequestId) -> bool {
        let mut state = self.lock();
        let removed = state.requests.remove(request_id).is_some();
        if removed {
            debug!(%request_id, "PendingTable::remove: abandoned request");
            state.metrics.pending_requests = state.requests.len();
        }
        removed
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.lock().requests.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CorrelatorMetrics {
        self.lock().metrics.clone()
    }
}

/// Owns one call's request id and guarantees its entry leaves the table
///
/// Dropping the guard removes the entry if it is still present. The guard
/// also tracks whether the call's direct self invocation is still running.
pub(crate) struct PendingGuard {
    table: PendingTable,
    request_id: RequestId,
    local_outstanding: AtomicBool,
}

impl PendingGuard {
    pub(crate) fn new(table: PendingTable, request_id: RequestId) -> Self {
        Self {
            table,
            request_id,
            local_outstanding: AtomicBool::new(false),
        }
    }

    pub(crate) fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub(crate) fn register(&self, topic: &str, targets: &[u32]) -> FanoutResult<oneshot::Receiver<Vec<Value>>> {
        self.table
            .insert(self.request_id.clone(), topic, targets.iter().copied())
    }

    pub(crate) fn set_local_outstanding(&self, outstanding: bool) {
        self.local_outstanding.store(outstanding, Ordering::SeqCst);
    }

    /// Give up on the call; returns every result still missing, remote and self
    pub(crate) fn expire(&self) -> usize {
        let remote = self.table.expire(&self.request_id).unwrap_or(0);
        remote + usize::from(self.local_outstanding.load(Ordering::SeqCst))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}
