//! The pending-request table: the correlation state for one [`super::Connection`].
//!
//! Invariant (see design document §8.2): after the owning connection is
//! closed, this table is empty. Every entry is removed exactly once, by
//! whichever of {response arrives, timeout fires, cancel requested, close}
//! happens first.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::ConnectionError;
use crate::protocol::RequestId;

/// A progress update forwarded from a child's `notifications/progress`.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

/// One outstanding request: a waiter for the terminal result, an optional
/// sink for progress notifications, and the deadline that governs it.
pub struct PendingEntry {
    pub result_tx: Option<oneshot::Sender<Result<Value, ConnectionError>>>,
    pub progress_sink: Option<mpsc::UnboundedSender<ProgressEvent>>,
    pub deadline: Instant,
    pub reset_deadline_on_progress: bool,
}

/// The correlation table, keyed by the numeric id the connection assigned
/// to the outgoing request.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<RequestId, PendingEntry>,
    closed: bool,
}

impl PendingTable {
    /// Registers a new entry. Callers must check [`Self::is_closed`] first
    /// under the same lock acquisition — inserting after close leaves the
    /// entry stranded forever, since no reader task remains to resolve it.
    pub fn insert(&mut self, id: RequestId, entry: PendingEntry) {
        self.entries.insert(id, entry);
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Removes and resolves the entry for `id`, if any. Returns `true` if
    /// an entry was found.
    pub fn resolve(&mut self, id: &RequestId, outcome: Result<Value, ConnectionError>) -> bool {
        if let Some(mut entry) = self.entries.remove(id) {
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(outcome);
            }
            true
        } else {
            false
        }
    }

    /// Forwards a progress update to the sink for `id`, if one is registered,
    /// and resets its deadline when the entry opted in.
    pub fn on_progress(&mut self, id: &RequestId, event: ProgressEvent, now: Instant, default_ttl: std::time::Duration) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.reset_deadline_on_progress {
                entry.deadline = now + default_ttl;
            }
            if let Some(sink) = &entry.progress_sink {
                let _ = sink.send(event);
            }
        }
    }

    /// Removes every entry whose deadline has passed, returning their ids.
    pub fn take_expired(&mut self, now: Instant) -> Vec<RequestId> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(mut entry) = self.entries.remove(id) {
                if let Some(tx) = entry.result_tx.take() {
                    let _ = tx.send(Err(ConnectionError::Timeout));
                }
            }
        }
        expired
    }

    /// Rejects and removes every entry, and marks the table closed so that
    /// any later `insert` can be rejected immediately instead of stranding
    /// its waiter. Used on `close()` and on unsolicited child exit.
    pub fn reject_all(&mut self, make_error: impl Fn() -> ConnectionError) {
        self.closed = true;
        for (_, mut entry) in self.entries.drain() {
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(Err(make_error()));
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
