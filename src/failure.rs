//! Single-slot failure sink bridging producer and consumer threads.
//!
//! # Design
//!
//! A session's producer thread cannot return an error to the consumer
//! directly, so the first failure it hits is parked in a [`FailureCell`] and
//! re-surfaced by the consumer-facing calls. First error wins: later failures
//! are logged and dropped, since by then the session is already tearing down
//! and the root cause is the one worth reporting.
//!
//! # Invariants
//!
//! - At most one error is ever stored; `arm` after the first is a no-op.
//! - Consumers observe the error only after draining already-buffered
//!   results, which is enforced by the callers, not here.

use std::sync::Mutex;

use tracing::warn;

use crate::error::Error;

/// First-error-wins cell shared between a session's two threads.
#[derive(Debug, Default)]
pub struct FailureCell {
    slot: Mutex<Option<Error>>,
}

impl FailureCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `err` if no failure is armed yet.
    ///
    /// Returns whether this call stored the error.
    pub fn arm(&self, err: Error) -> bool {
        let mut slot = self.slot.lock().expect("failure cell mutex poisoned");
        match &*slot {
            Some(first) => {
                warn!(first = %first, dropped = %err, "failure cell already armed");
                false
            }
            None => {
                *slot = Some(err);
                true
            }
        }
    }

    /// Clone of the armed failure, if any.
    pub fn get(&self) -> Option<Error> {
        self.slot
            .lock()
            .expect("failure cell mutex poisoned")
            .clone()
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .expect("failure cell mutex poisoned")
            .is_some()
    }
}
