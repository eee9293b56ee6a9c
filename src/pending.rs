//! Outstanding requests awaiting a response from the extension.
//!
//! Each entry owns the sending half of a one-shot result slot. Completing an
//! entry removes it from the table, so a second completion for the same id
//! finds nothing and is reported back to the caller instead of being applied.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BridgeError;
use crate::protocol::{RequestId, ResponseData};

type Slot = oneshot::Sender<Result<ResponseData, BridgeError>>;

struct PendingEntry {
    slot: Slot,
    deadline: Instant,
}

#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<HashMap<RequestId, PendingEntry>>>,
}

/// Receiving side of a pending entry, held by the caller awaiting the result.
///
/// Dropping the handle removes the entry if it is still pending, so a caller
/// that stops waiting (timeout, cancellation) never leaves a stale entry.
pub struct PendingHandle {
    id: RequestId,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Result<ResponseData, BridgeError>>>,
    table: PendingTable,
}

impl PendingHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the slot to be completed, up to the entry's deadline.
    ///
    /// Returns `None` when the deadline passes first; the entry is removed
    /// before returning.
    pub async fn wait(mut self) -> Option<Result<ResponseData, BridgeError>> {
        let rx = self.rx.take()?;
        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => Some(Err(BridgeError::Cancelled(format!(
                "result slot for request {} was dropped",
                self.id
            )))),
            Err(_) => {
                self.table.remove(self.id);
                None
            }
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending entry with the given deadline.
    pub fn register(&self, id: RequestId, deadline: Instant) -> Result<PendingHandle, BridgeError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.inner.lock();
            if entries.contains_key(&id) {
                return Err(BridgeError::DuplicateRequestId(id));
            }
            entries.insert(id, PendingEntry { slot: tx, deadline });
        }
        Ok(PendingHandle {
            id,
            deadline,
            rx: Some(rx),
            table: self.clone(),
        })
    }

    /// Complete an entry with a response. Returns `false` if no entry exists
    /// (late, duplicate, or unknown id).
    pub fn resolve(&self, id: RequestId, data: ResponseData) -> bool {
        self.complete(id, Ok(data))
    }

    /// Complete an entry with an error. Returns `false` if no entry exists.
    pub fn fail(&self, id: RequestId, error: BridgeError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: RequestId, result: Result<ResponseData, BridgeError>) -> bool {
        let Some(entry) = self.inner.lock().remove(&id) else {
            return false;
        };
        if entry.slot.send(result).is_err() {
            tracing::debug!(request_id = id, "waiter gone before result was delivered");
        }
        true
    }

    /// Drop an entry without completing it. Idempotent.
    pub fn remove(&self, id: RequestId) -> bool {
        self.inner.lock().remove(&id).is_some()
    }

    /// Fail every remaining entry with an error built by `make_error`.
    /// Returns how many entries were failed.
    pub fn fail_all(&self, make_error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<(RequestId, PendingEntry)> = self.inner.lock().drain().collect();
        let now = Instant::now();
        let count = drained.len();
        for (id, entry) in drained {
            let overdue = entry.deadline <= now;
            tracing::debug!(request_id = id, overdue, "failing pending request");
            let _ = entry.slot.send(Err(make_error()));
        }
        count
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub fn deadline(&self, id: RequestId) -> Option<Instant> {
        self.inner.lock().get(&id).map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Ids currently pending, in ascending order.
    pub fn ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.inner.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
