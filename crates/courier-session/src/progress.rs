//! Routing of progress notifications to per-call callbacks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use courier_wire::ProgressToken;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

/// A progress update for one long-running call.
///
/// Ephemeral: delivered to the registered callback and dropped. An event
/// whose token has no registered callback is discarded, which is normal
/// for a call that already resolved.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressEvent {
    /// The token tying this event to its call.
    #[serde(rename = "progressToken")]
    pub token: ProgressToken,
    /// Work completed so far.
    pub progress: f64,
    /// Total work expected, when the server knows it.
    #[serde(default)]
    pub total: Option<f64>,
    /// Human-readable status line.
    #[serde(default)]
    pub message: Option<String>,
}

/// Callback invoked for each progress event of one call.
///
/// Runs synchronously on the session's dispatch task: it must return
/// quickly or hand heavy work to another task, since everything it delays
/// is the delivery of subsequent messages.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Associates progress tokens with the callback of the owning call.
pub struct ProgressRouter {
    callbacks: Mutex<HashMap<ProgressToken, ProgressCallback>>,
}

impl ProgressRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a callback for a token, replacing any previous one.
    pub fn register(&self, token: ProgressToken, callback: ProgressCallback) {
        self.callbacks.lock().insert(token, callback);
    }

    /// Removes the callback for a token. Returns whether one existed.
    pub fn unregister(&self, token: &ProgressToken) -> bool {
        self.callbacks.lock().remove(token).is_some()
    }

    /// Delivers one event to its registered callback, at most once.
    /// Returns whether a callback was invoked.
    ///
    /// A panicking callback is caught and logged so the dispatch loop
    /// survives it.
    pub fn deliver(&self, event: ProgressEvent) -> bool {
        let callback = self.callbacks.lock().get(&event.token).cloned();
        match callback {
            Some(callback) => {
                let token = event.token.clone();
                if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    warn!(token = %token, "progress callback panicked");
                }
                true
            }
            None => {
                debug!(token = %event.token, "dropping progress event for unknown token");
                false
            }
        }
    }

    /// Number of tokens currently registered.
    pub fn registered(&self) -> usize {
        self.callbacks.lock().len()
    }
}

impl Default for ProgressRouter {
    fn default() -> Self {
        Self::new()
    }
}
