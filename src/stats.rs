//! Session timing and throughput statistics.
//!
//! # Design
//!
//! Four wall-clock timers track where a session spends its time, plus a
//! counter of keys handed to the buffer. Timers are *pausable*: `resume` and
//! `suspend` bracket each measured stretch, accumulating across stretches.
//! Both calls are idempotent so instrumentation sites never need to know
//! whether the timer is currently running; resuming a running timer or
//! suspending a stopped one is a no-op.
//!
//! Stats are shared across threads (consumer calls bracket `has_next`, the
//! producer brackets store work), hence interior mutability throughout.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ==== Timer kinds ====

/// The stretches of session work measured independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Consumer-side waiting in `has_next`.
    HasNext,
    /// Producer-side draining of an open store scan.
    ScannerIterate,
    /// Producer-side resource acquisition and scan setup.
    ScannerStart,
    /// Whole-session runtime, driven by lifecycle listeners.
    Runtime,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::HasNext,
        TimerKind::ScannerIterate,
        TimerKind::ScannerStart,
        TimerKind::Runtime,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::HasNext => 0,
            TimerKind::ScannerIterate => 1,
            TimerKind::ScannerStart => 2,
            TimerKind::Runtime => 3,
        }
    }
}

// ==== Pausable timer ====

#[derive(Debug, Default)]
struct TimerState {
    accumulated: Duration,
    resumed_at: Option<Instant>,
}

/// Accumulating wall-clock timer with idempotent resume/suspend.
#[derive(Debug, Default)]
pub struct PausableTimer {
    state: Mutex<TimerState>,
}

impl PausableTimer {
    /// Starts a measured stretch. No-op if already running.
    pub fn resume(&self) {
        let mut state = self.state.lock().expect("timer mutex poisoned");
        if state.resumed_at.is_none() {
            state.resumed_at = Some(Instant::now());
        }
    }

    /// Ends the current stretch, folding it into the total. No-op if stopped.
    pub fn suspend(&self) {
        let mut state = self.state.lock().expect("timer mutex poisoned");
        if let Some(started) = state.resumed_at.take() {
            state.accumulated += started.elapsed();
        }
    }

    /// Total measured time, including any stretch still running.
    pub fn elapsed(&self) -> Duration {
        let state = self.state.lock().expect("timer mutex poisoned");
        match state.resumed_at {
            Some(started) => state.accumulated + started.elapsed(),
            None => state.accumulated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .expect("timer mutex poisoned")
            .resumed_at
            .is_some()
    }
}

// ==== Session stats ====

/// Shared statistics for one scan session.
#[derive(Debug, Default)]
pub struct ScanSessionStats {
    timers: [PausableTimer; 4],
    keys_seen: AtomicU64,
}

impl ScanSessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timer(&self, kind: TimerKind) -> &PausableTimer {
        &self.timers[kind.index()]
    }

    /// Puts every timer into the armed-but-suspended baseline state.
    ///
    /// Called once when the owning session starts; safe to call again.
    pub fn initialize(&self) {
        for kind in TimerKind::ALL {
            self.timer(kind).suspend();
        }
    }

    /// Suspends everything after a failure so totals stop growing.
    pub fn stop_on_failure(&self) {
        for kind in TimerKind::ALL {
            self.timer(kind).suspend();
        }
    }

    pub fn increment_keys_seen(&self, by: u64) {
        self.keys_seen.fetch_add(by, Ordering::Relaxed);
    }

    pub fn keys_seen(&self) -> u64 {
        self.keys_seen.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all totals.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            has_next: self.timer(TimerKind::HasNext).elapsed(),
            scanner_iterate: self.timer(TimerKind::ScannerIterate).elapsed(),
            scanner_start: self.timer(TimerKind::ScannerStart).elapsed(),
            runtime: self.timer(TimerKind::Runtime).elapsed(),
            keys_seen: self.keys_seen(),
        }
    }
}

/// Immutable copy of session totals at one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub has_next: Duration,
    pub scanner_iterate: Duration,
    pub scanner_start: Duration,
    pub runtime: Duration,
    pub keys_seen: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "has_next={:?} scanner_iterate={:?} scanner_start={:?} runtime={:?} keys_seen={}",
            self.has_next, self.scanner_iterate, self.scanner_start, self.runtime, self.keys_seen
        )
    }
}
