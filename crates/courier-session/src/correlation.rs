//! Correlation of outstanding requests to their responses.
//!
//! The table is the only mutable structure shared between the dispatch
//! task and caller tasks, and a single lock serializes every register,
//! resolve, cancel, and drain. Each slot is resolved at most once: the
//! winner removes it from the map, and anything arriving later for the
//! same id finds nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use courier_core::{CourierError, CourierResult};
use courier_wire::{ProgressToken, RequestId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// One caller's handle on an in-flight request.
///
/// Owned by the issuing task; the table keeps the sending half. Waiting
/// consumes the handle, mirroring the single-assignment slot.
#[derive(Debug)]
pub struct PendingCall {
    /// The request id this call registered.
    pub id: RequestId,
    /// Method name, kept for diagnostics.
    pub method: String,
    /// Progress token attached to the request, if any.
    pub progress_token: Option<ProgressToken>,
    /// When the call was registered.
    pub enqueued_at: DateTime<Utc>,
    rx: oneshot::Receiver<CourierResult<Value>>,
}

impl PendingCall {
    /// Suspends until the call is resolved, cancelled, or drained.
    pub async fn wait(self) -> CourierResult<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The table never drops a sender without resolving it; this
            // covers a session torn down without a drain.
            Err(_) => Err(CourierError::SessionClosed(
                "response slot dropped".into(),
            )),
        }
    }
}

struct Slot {
    method: String,
    progress_token: Option<ProgressToken>,
    tx: oneshot::Sender<CourierResult<Value>>,
}

struct TableState {
    slots: HashMap<RequestId, Slot>,
    /// Set once by `drain_all`; a drained table refuses new slots so a
    /// close racing a register cannot strand a call.
    drained: Option<String>,
}

/// Maps outstanding request ids to pending-response slots.
pub struct CorrelationTable {
    state: Mutex<TableState>,
    next_id: AtomicU64,
}

impl CorrelationTable {
    /// Creates an empty table with a fresh id counter.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                slots: HashMap::new(),
                drained: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a unique id and registers a slot for it.
    ///
    /// Ids come from a session-scoped counter and are never reused, so a
    /// late response to an old id can never be mis-delivered to a new
    /// call. Fails once the table has been drained.
    pub fn register(
        &self,
        method: &str,
        progress_token: Option<ProgressToken>,
    ) -> CourierResult<PendingCall> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock();
        if let Some(reason) = &state.drained {
            return Err(CourierError::SessionClosed(reason.clone()));
        }
        state.slots.insert(
            id.clone(),
            Slot {
                method: method.to_string(),
                progress_token: progress_token.clone(),
                tx,
            },
        );
        drop(state);

        Ok(PendingCall {
            id,
            method: method.to_string(),
            progress_token,
            enqueued_at: Utc::now(),
            rx,
        })
    }

    /// Resolves the slot for `id` with the given outcome. Returns whether
    /// a slot existed; resolving an unknown or already-resolved id is a
    /// no-op.
    pub fn resolve(&self, id: &RequestId, outcome: CourierResult<Value>) -> bool {
        let slot = self.state.lock().slots.remove(id);
        match slot {
            Some(slot) => {
                // The receiver may be gone if the caller timed out; the
                // slot is still consumed exactly once.
                let _ = slot.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Cancels the slot for `id`, waking its caller with a cancellation
    /// error. Returns whether a slot existed.
    pub fn cancel(&self, id: &RequestId, reason: &str) -> bool {
        let slot = self.state.lock().slots.remove(id);
        match slot {
            Some(slot) => {
                debug!(id = %id, method = %slot.method, reason, "cancelled pending call");
                let _ = slot.tx.send(Err(CourierError::Cancelled(reason.to_string())));
                true
            }
            None => false,
        }
    }

    /// Resolves every outstanding slot with an error produced by `reason`
    /// and refuses all future registrations with the same message.
    /// Returns how many calls were failed.
    pub fn drain_all<F>(&self, reason: F) -> usize
    where
        F: Fn() -> CourierError,
    {
        let slots = {
            let mut state = self.state.lock();
            if state.drained.is_none() {
                state.drained = Some(reason().to_string());
            }
            std::mem::take(&mut state.slots)
        };
        let drained = slots.len();
        for (id, slot) in slots {
            debug!(id = %id, method = %slot.method, "failing pending call on drain");
            let _ = slot.tx.send(Err(reason()));
        }
        drained
    }

    /// The progress token registered for `id`, if the call is still
    /// outstanding.
    pub fn progress_token(&self, id: &RequestId) -> Option<ProgressToken> {
        self.state
            .lock()
            .slots
            .get(id)
            .and_then(|slot| slot.progress_token.clone())
    }

    /// Number of currently outstanding calls.
    pub fn outstanding(&self) -> usize {
        self.state.lock().slots.len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
