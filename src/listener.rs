//! Session lifecycle listeners.
//!
//! Listeners observe state transitions without participating in them: a
//! failed listener callback must never be able to wedge the session, so the
//! trait methods are infallible and implementations are expected to swallow
//! their own errors.

use std::sync::Arc;

use crate::error::Error;
use crate::stats::{ScanSessionStats, TimerKind};

/// Observer of session lifecycle transitions.
pub trait ServiceListener: Send + Sync {
    /// The session is about to start its producer thread.
    fn starting(&self) {}

    /// The session stopped normally.
    fn stopping(&self);

    /// The session's producer failed. `session_id` names the source.
    fn failed(&self, session_id: &str, cause: &Error);
}

/// Built-in listener that drives the [`TimerKind::Runtime`] timer.
pub struct StatsListener {
    stats: Arc<ScanSessionStats>,
}

impl StatsListener {
    pub fn new(stats: Arc<ScanSessionStats>) -> Self {
        Self { stats }
    }
}

impl ServiceListener for StatsListener {
    fn starting(&self) {
        self.stats.timer(TimerKind::Runtime).resume();
    }

    fn stopping(&self) {
        self.stats.timer(TimerKind::Runtime).suspend();
    }

    fn failed(&self, _session_id: &str, _cause: &Error) {
        self.stats.stop_on_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn runtime_timer_tracks_start_stop() {
        let stats = Arc::new(ScanSessionStats::new());
        let listener = StatsListener::new(Arc::clone(&stats));

        listener.starting();
        assert!(stats.timer(TimerKind::Runtime).is_running());
        thread::sleep(Duration::from_millis(5));
        listener.stopping();
        assert!(!stats.timer(TimerKind::Runtime).is_running());
        assert!(stats.timer(TimerKind::Runtime).elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn failure_suspends_all_timers() {
        let stats = Arc::new(ScanSessionStats::new());
        let listener = StatsListener::new(Arc::clone(&stats));

        stats.timer(TimerKind::ScannerIterate).resume();
        listener.starting();
        listener.failed("session-1", &Error::Store("boom".into()));
        for kind in TimerKind::ALL {
            assert!(!stats.timer(kind).is_running(), "{kind:?} still running");
        }
    }
}
