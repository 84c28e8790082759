//! Request correlator - pairs outgoing requests with their responses.
//!
//! Each outgoing call registers a pending slot keyed by a fresh
//! [`RequestId`]. The reader side completes slots as responses arrive; the
//! caller awaits its [`PendingCall`] with a deadline. Every slot completes
//! exactly once: by a response, by its timeout, or by connection teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bridge::protocol::{RemoteError, RequestId};
use crate::error::CallError;

type Outcome = Result<Value, CallError>;

#[derive(Default)]
struct PendingTable {
    slots: HashMap<RequestId, oneshot::Sender<Outcome>>,
    /// Set once by `cancel_all`; later registrations fail with this reason.
    closed: Option<String>,
}

pub struct RequestCorrelator {
    table: Mutex<PendingTable>,
    next_id: AtomicU64,
}

impl RequestCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pending request table mutex poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Allocate a request id and register a pending slot for it.
    ///
    /// Fails once the correlator has been torn down.
    pub fn register(self: &Arc<Self>) -> Result<PendingCall, CallError> {
        let id = RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(CallError::Closed(reason.clone()));
        }
        table.slots.insert(id.clone(), tx);
        drop(table);

        tracing::trace!(request_id = %id, "Registered pending request");
        Ok(PendingCall {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Complete a pending slot with a result. Returns false if no slot matched.
    pub fn resolve(&self, id: &RequestId, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Complete a pending slot with a remote error. Returns false if no slot matched.
    pub fn reject(&self, id: &RequestId, error: RemoteError) -> bool {
        self.complete(id, Err(error))
    }

    /// Route a decoded response outcome to its slot.
    pub fn complete(&self, id: &RequestId, outcome: Result<Value, RemoteError>) -> bool {
        self.complete_slot(id, outcome.map_err(CallError::Remote))
    }

    fn complete_slot(&self, id: &RequestId, outcome: Outcome) -> bool {
        let slot = self.lock().slots.remove(id);
        match slot {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(request_id = %id, "Caller stopped waiting before response arrived");
                }
                true
            }
            None => {
                tracing::warn!(request_id = %id, "Discarding response for unknown or completed request");
                false
            }
        }
    }

    /// Fail every pending slot and refuse further registrations.
    ///
    /// Returns the number of slots that were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.slots.drain().collect()
        };

        let count = drained.len();
        for (id, tx) in drained {
            tracing::debug!(request_id = %id, %reason, "Cancelling pending request");
            let _ = tx.send(Err(CallError::Closed(reason.to_string())));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn forget(&self, id: &RequestId) {
        self.lock().slots.remove(id);
    }
}

/// Handle for one registered request.
///
/// Dropping the handle without awaiting it releases the slot, so a response
/// arriving later is treated as unknown.
pub struct PendingCall {
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<RequestCorrelator>,
}

impl PendingCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the slot to complete, or fail with `Timeout` after `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<Value, CallError> {
        self.wait_until(Instant::now() + timeout, timeout).await
    }

    /// Like [`wait`](Self::wait) against an absolute deadline. `timeout` is
    /// the caller's whole budget and is what a `Timeout` error reports.
    pub async fn wait_until(
        mut self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Closed(
                "request slot dropped without a response".to_string(),
            )),
            Err(_) => {
                tracing::debug!(request_id = %self.id, ?timeout, "Request timed out");
                Err(CallError::Timeout(timeout))
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.forget(&self.id);
    }
}
