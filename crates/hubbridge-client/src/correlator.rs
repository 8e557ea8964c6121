//! Request correlation.
//!
//! Each outgoing request gets the next positive id and a one-shot slot.
//! The matching `result` frame (or the caller's timeout) removes the entry,
//! so every id resolves at most once and nothing is left behind.

use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{HubError, HubResult};

/// Outcome delivered to a waiting caller.
pub type Outcome = HubResult<serde_json::Value>;

/// A request waiting for its `result` frame.
#[derive(Debug)]
pub struct PendingRequest {
    pub kind: String,
    pub issued_at: Instant,
    slot: oneshot::Sender<Outcome>,
}

/// Pending requests keyed by correlation id.
#[derive(Debug)]
pub struct Correlator {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Reserve an id without registering a pending slot (used for pings).
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a new pending request and return its id and result slot.
    pub fn register(&mut self, kind: &str) -> (u64, oneshot::Receiver<Outcome>) {
        let id = self.next_id();
        let (slot, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                kind: kind.to_string(),
                issued_at: Instant::now(),
                slot,
            },
        );
        (id, rx)
    }

    /// Deliver an outcome. Returns `false` if the id is unknown, e.g. it
    /// already timed out.
    pub fn resolve(&mut self, id: u64, outcome: Outcome) -> bool {
        match self.pending.remove(&id) {
            Some(request) => {
                trace!(
                    id,
                    kind = %request.kind,
                    elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                    "Resolving request"
                );
                // The caller may have gone away; the entry is removed either way.
                let _ = request.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it.
    pub fn forget(&mut self, id: u64) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Fail every pending request with `NotConnected`.
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            let _ = request.slot.send(Err(HubError::NotConnected));
        }
        count
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
