//! Windowed range-scan sessions.
//!
//! # Design
//!
//! A [`ScanSession`] decouples result consumption from result production.
//! The consumer drives the familiar `has_next`/`next_entry` surface; a
//! dedicated producer thread works through the session's range backlog in
//! *fetch units*, each of which checks a resource out of the shared
//! [`ResourcePool`], drains one store scan into the bounded buffer, and
//! releases the resource again. Between fetch units the session holds no
//! resource at all, which is what lets many idle sessions share a small pool.
//!
//! Progress is tracked as a resumption point: the last key enqueued to the
//! buffer. The next fetch unit resumes from that key's successor, so entries
//! are delivered exactly once in ascending key order per range even though
//! the underlying scan is reopened many times.
//!
//! # Invariants
//!
//! - A resource is held only within a single fetch unit, never across units,
//!   and is released on every exit path.
//! - `last_seen` advances only after the entry is in the buffer, so a crash
//!   between scans never skips an undelivered entry.
//! - Buffered results are always drained before an armed failure is
//!   surfaced.
//! - In fair mode one fetch unit enqueues at most `ceil(1.5 * max_results)`
//!   entries before yielding its resource.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::failure::FailureCell;
use crate::key::{Entry, Key, KeyGranularity};
use crate::listener::{ServiceListener, StatsListener};
use crate::pool::ResourcePool;
use crate::range::ScanRange;
use crate::resource::ResourceKind;
use crate::stats::{ScanSessionStats, TimerKind};
use crate::store::{AuthSet, ScanOptions, TableId};

// ==== Configuration ====

/// Construction-time knobs for a [`ScanSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identifier handed to lifecycle listeners on failure.
    pub session_id: String,
    /// Result-buffer capacity and the base of the fairness cap.
    pub max_results: usize,
    /// How long one consumer poll waits before re-checking liveness.
    pub poll_timeout: Duration,
    /// How long the producer waits to enqueue one entry before yielding.
    pub offer_timeout: Duration,
    /// Whether a fetch unit caps its drain to share the pool fairly.
    pub fair: bool,
    /// Granularity of the successor key used to resume mid-range.
    pub resume_granularity: KeyGranularity,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: "scan-session".into(),
            max_results: 1000,
            poll_timeout: Duration::from_secs(1),
            offer_timeout: Duration::from_millis(200),
            fair: true,
            resume_granularity: KeyGranularity::Qualifier,
        }
    }
}

/// Mutable per-session scan settings, guarded by one lock.
struct SessionCfg {
    backlog: VecDeque<ScanRange>,
    /// Highest range of the current set; marks where the whole scan ends.
    last_range: Option<ScanRange>,
    options: ScanOptions,
    kind: ResourceKind,
    fair: bool,
    max_results: usize,
}

// ==== Shared state ====

/// State visible to both the consumer and the producer thread.
struct Shared {
    session_id: String,
    table: TableId,
    auths: AuthSet,
    pool: Arc<ResourcePool>,
    poll_timeout: Duration,
    offer_timeout: Duration,
    resume_granularity: KeyGranularity,
    cfg: Mutex<SessionCfg>,
    started: AtomicBool,
    running: AtomicBool,
    force_close: AtomicBool,
    /// Lease held by the in-flight fetch unit, if any. Shared with `close`
    /// so an abandoning consumer can return the slot to the pool itself.
    held: Mutex<Option<crate::pool::ResourceLease>>,
    sink: Arc<FailureCell>,
    listeners: Mutex<Vec<Arc<dyn ServiceListener>>>,
    stats: Mutex<Option<Arc<ScanSessionStats>>>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> Option<Arc<ScanSessionStats>> {
        self.stats.lock().expect("stats mutex poisoned").clone()
    }

    fn listeners(&self) -> Vec<Arc<dyn ServiceListener>> {
        self.listeners
            .lock()
            .expect("listener mutex poisoned")
            .clone()
    }

    /// Stops the producer loop, firing `stopping` exactly once.
    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!(session = %self.session_id, "session stopping");
            for listener in self.listeners() {
                listener.stopping();
            }
        }
    }

    /// Stops the producer loop after a failure, firing `failed` exactly once.
    fn fail(&self, cause: &Error) {
        if self.running.swap(false, Ordering::SeqCst) {
            for listener in self.listeners() {
                listener.failed(&self.session_id, cause);
            }
        }
    }

    /// Releases the lease held by an in-flight fetch unit, if any.
    fn release_held(&self) {
        let lease = self.held.lock().expect("lease mutex poisoned").take();
        if lease.is_some() {
            trace!(session = %self.session_id, "released held resource");
        }
        drop(lease);
    }
}

// ==== Session ====

/// Asynchronous windowed scan over a set of key ranges.
///
/// Not started until the first `has_next` (or an explicit [`start`]); once
/// started, configuration is frozen. The session implements `Iterator`, with
/// an armed producer failure surfaced as an `Err` item after all buffered
/// entries have been yielded.
///
/// [`start`]: ScanSession::start
pub struct ScanSession {
    shared: Arc<Shared>,
    receiver: Option<Receiver<Entry>>,
    current: Option<Entry>,
    worker: Option<JoinHandle<()>>,
}

impl ScanSession {
    /// Builds an idle session over `table` using resources from `pool`.
    pub fn new(
        table: TableId,
        auths: AuthSet,
        pool: Arc<ResourcePool>,
        config: SessionConfig,
    ) -> Result<Self> {
        if config.max_results == 0 {
            return Err(Error::Config("max_results must be nonzero".into()));
        }
        if config.poll_timeout.is_zero() || config.offer_timeout.is_zero() {
            return Err(Error::Config("timeouts must be nonzero".into()));
        }
        let shared = Arc::new(Shared {
            session_id: config.session_id,
            table,
            auths,
            pool,
            poll_timeout: config.poll_timeout,
            offer_timeout: config.offer_timeout,
            resume_granularity: config.resume_granularity,
            cfg: Mutex::new(SessionCfg {
                backlog: VecDeque::new(),
                last_range: None,
                options: ScanOptions::default(),
                kind: ResourceKind::default(),
                fair: config.fair,
                max_results: config.max_results,
            }),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            force_close: AtomicBool::new(false),
            held: Mutex::new(None),
            sink: Arc::new(FailureCell::new()),
            listeners: Mutex::new(Vec::new()),
            stats: Mutex::new(None),
        });
        Ok(Self {
            shared,
            receiver: None,
            current: None,
            worker: None,
        })
    }

    /// Convenience constructor that also seeds the range backlog.
    pub fn with_ranges(
        table: TableId,
        auths: AuthSet,
        pool: Arc<ResourcePool>,
        config: SessionConfig,
        ranges: Vec<ScanRange>,
    ) -> Result<Self> {
        let mut session = Self::new(table, auths, pool, config)?;
        session.set_ranges(ranges)?;
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Whether the producer thread is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Replaces the range backlog. Rejected once the session has started.
    ///
    /// Ranges are sorted by start key before queueing so the backlog is
    /// worked in ascending order.
    pub fn set_ranges(&mut self, mut ranges: Vec<ScanRange>) -> Result<&mut Self> {
        if self.shared.started.load(Ordering::SeqCst) {
            return Err(Error::illegal_state(
                "ranges cannot be replaced after the session has started",
            ));
        }
        ranges.sort();
        {
            let mut cfg = self.shared.cfg.lock().expect("config mutex poisoned");
            cfg.last_range = ranges.last().cloned();
            cfg.backlog = ranges.into();
        }
        Ok(self)
    }

    /// Highest range of the current set, if any.
    pub fn last_range(&self) -> Option<ScanRange> {
        self.shared
            .cfg
            .lock()
            .expect("config mutex poisoned")
            .last_range
            .clone()
    }

    /// Number of ranges not yet begun.
    pub fn pending_ranges(&self) -> usize {
        self.shared
            .cfg
            .lock()
            .expect("config mutex poisoned")
            .backlog
            .len()
    }

    /// Replaces the per-scan store options.
    pub fn set_options(&mut self, options: ScanOptions) -> &mut Self {
        self.shared
            .cfg
            .lock()
            .expect("config mutex poisoned")
            .options = options;
        self
    }

    /// Selects the scan strategy used by subsequent fetch units.
    pub fn set_resource_kind(&mut self, kind: ResourceKind) -> &mut Self {
        self.shared.cfg.lock().expect("config mutex poisoned").kind = kind;
        self
    }

    /// Enables or disables the fair-drain cap.
    pub fn set_fairness(&mut self, fair: bool) -> &mut Self {
        self.shared.cfg.lock().expect("config mutex poisoned").fair = fair;
        self
    }

    /// Resizes the result buffer. Rejected once the session has started.
    pub fn set_max_results(&mut self, max_results: usize) -> Result<&mut Self> {
        if self.shared.started.load(Ordering::SeqCst) {
            return Err(Error::illegal_state(
                "buffer capacity cannot change after the session has started",
            ));
        }
        if max_results == 0 {
            return Err(Error::Config("max_results must be nonzero".into()));
        }
        self.shared
            .cfg
            .lock()
            .expect("config mutex poisoned")
            .max_results = max_results;
        Ok(self)
    }

    /// Registers a lifecycle listener.
    pub fn add_listener(&mut self, listener: Arc<dyn ServiceListener>) -> &mut Self {
        self.shared
            .listeners
            .lock()
            .expect("listener mutex poisoned")
            .push(listener);
        self
    }

    /// Attaches a stats collector and its runtime listener. One-shot.
    pub fn apply_stats(&mut self, stats: Arc<ScanSessionStats>) -> Result<&mut Self> {
        {
            let mut slot = self.shared.stats.lock().expect("stats mutex poisoned");
            if slot.is_some() {
                return Err(Error::illegal_state("stats already applied"));
            }
            *slot = Some(Arc::clone(&stats));
        }
        self.add_listener(Arc::new(StatsListener::new(stats)));
        Ok(self)
    }

    /// The stats collector, if one was applied.
    pub fn statistics(&self) -> Option<Arc<ScanSessionStats>> {
        self.shared.stats()
    }

    /// The failure sink shared with the producer thread.
    pub fn failure_sink(&self) -> Arc<FailureCell> {
        Arc::clone(&self.shared.sink)
    }

    /// Starts the producer thread. Idempotent; `has_next` calls this lazily.
    pub fn start(&mut self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stats) = self.shared.stats() {
            stats.initialize();
        }
        for listener in self.shared.listeners() {
            listener.starting();
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let capacity = self
            .shared
            .cfg
            .lock()
            .expect("config mutex poisoned")
            .max_results;
        let (sender, receiver) = bounded(capacity);
        self.receiver = Some(receiver);

        let shared = Arc::clone(&self.shared);
        let name = format!("rangescan-{}", self.shared.session_id);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || produce(shared, sender))
            .expect("failed to spawn session producer thread");
        self.worker = Some(handle);
        debug!(session = %self.shared.session_id, "session started");
    }

    /// Stops the producer loop without discarding buffered results.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Tears the session down: stops the producer and returns any held
    /// resource to the pool immediately, even mid-fetch.
    ///
    /// Errors from the abandoned fetch unit are logged and swallowed.
    /// Idempotent; also called on drop.
    pub fn close(&mut self) {
        self.shared.force_close.store(true, Ordering::SeqCst);
        self.shared.stop();
        self.shared.release_held();
    }

    /// Whether another entry is available, blocking while the producer may
    /// still deliver one.
    ///
    /// Lazily starts the session. Returns `Err` only once the buffer and the
    /// staged entry are exhausted and the producer has recorded a failure.
    pub fn has_next(&mut self) -> Result<bool> {
        if !self.shared.started.load(Ordering::SeqCst) {
            self.start();
        }
        let stats = self.shared.stats();
        if let Some(stats) = &stats {
            stats.timer(TimerKind::HasNext).resume();
        }

        let receiver = self
            .receiver
            .as_ref()
            .expect("receiver exists once started")
            .clone();
        while self.current.is_none()
            && (self.shared.is_running() || !receiver.is_empty())
        {
            match receiver.recv_timeout(self.shared.poll_timeout) {
                Ok(entry) => self.current = Some(entry),
                Err(RecvTimeoutError::Timeout) => {
                    trace!(session = %self.shared.session_id, "poll timed out, re-checking");
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(stats) = &stats {
            stats.timer(TimerKind::HasNext).suspend();
        }

        if self.current.is_some() {
            return Ok(true);
        }
        if let Some(cause) = self.shared.sink.get() {
            error!(session = %self.shared.session_id, %cause, "session failed");
            return Err(cause);
        }
        Ok(false)
    }

    /// Takes the entry staged by the last `has_next`.
    ///
    /// Delivers a staged entry even when a failure is armed; the failure is
    /// surfaced only once nothing remains to deliver.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        if let Some(entry) = self.current.take() {
            return Ok(Some(entry));
        }
        if let Some(cause) = self.shared.sink.get() {
            return Err(cause);
        }
        Ok(None)
    }
}

impl Iterator for ScanSession {
    type Item = Result<Entry>;

    /// Yields entries in order; an armed failure becomes a trailing `Err`
    /// item (repeated on further calls, since the failure stays armed).
    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => self.next_entry().transpose(),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.close();
        // Dropping the receiver unblocks a producer parked on a full buffer.
        self.receiver = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!(session = %self.shared.session_id, "producer thread panicked");
            }
        }
    }
}

// ==== Producer ====

/// Producer-thread cursor: where the session is within its ranges.
#[derive(Default)]
struct Cursor {
    /// Last key enqueued to the buffer; `None` once the current range ends.
    last_seen: Option<Key>,
    /// Range the session is partway through.
    current_range: Option<ScanRange>,
}

/// Snapshot of the mutable settings a single fetch unit runs under.
struct UnitCfg {
    options: ScanOptions,
    kind: ResourceKind,
    fair: bool,
    fairness_cap: u64,
}

fn produce(shared: Arc<Shared>, sender: Sender<Entry>) {
    let mut cursor = Cursor::default();
    let outcome = (|| -> Result<()> {
        while shared.is_running() {
            fetch_unit(&shared, &sender, &mut cursor)?;
        }
        Ok(())
    })();
    if let Err(cause) = outcome {
        error!(session = %shared.session_id, %cause, "producer failed");
        shared.sink.arm(cause.clone());
        shared.fail(&cause);
    }
}

/// One resource checkout: pick a range, open a scan, drain it into the
/// buffer, release the resource.
fn fetch_unit(shared: &Shared, sender: &Sender<Entry>, cursor: &mut Cursor) -> Result<()> {
    // Nothing queued and nothing to resume: the session is done.
    {
        let cfg = shared.cfg.lock().expect("config mutex poisoned");
        if cfg.backlog.is_empty() && cursor.last_seen.is_none() {
            drop(cfg);
            shared.stop();
            return Ok(());
        }
    }

    // A full buffer means the consumer is behind; yield without taking a
    // resource. The sleep keeps the re-check from spinning hot.
    if sender.is_full() {
        thread::sleep(shared.offer_timeout);
        return Ok(());
    }

    let stats = shared.stats();
    if let Some(stats) = &stats {
        stats.timer(TimerKind::ScannerStart).resume();
    }
    let lease = shared.pool.acquire();
    *shared.held.lock().expect("lease mutex poisoned") = Some(lease);

    let unit = run_unit(shared, sender, cursor, &stats);

    let outcome = match unit {
        // Continuation landed past the range end: the range is exhausted.
        Err(Error::EmptyRange { .. }) => {
            trace!(session = %shared.session_id, "range exhausted at continuation");
            cursor.last_seen = None;
            Ok(())
        }
        Err(cause) if shared.force_close.load(Ordering::SeqCst) => {
            debug!(session = %shared.session_id, %cause, "ignoring error during close");
            Ok(())
        }
        other => other,
    };

    if let Some(stats) = &stats {
        stats.timer(TimerKind::ScannerStart).suspend();
    }
    shared.release_held();
    outcome
}

/// The fallible middle of a fetch unit, bracketed by acquire/release.
fn run_unit(
    shared: &Shared,
    sender: &Sender<Entry>,
    cursor: &mut Cursor,
    stats: &Option<Arc<ScanSessionStats>>,
) -> Result<()> {
    let (range, unit_cfg) = {
        let mut cfg = shared.cfg.lock().expect("config mutex poisoned");
        let advance = match (&cursor.last_seen, &cursor.current_range) {
            (None, _) | (Some(_), None) => true,
            (Some(last), Some(current)) => last >= current.end(),
        };
        let range = if advance {
            match cfg.backlog.pop_front() {
                Some(next) => {
                    cursor.last_seen = None;
                    cursor.current_range = Some(next.clone());
                    next
                }
                None => {
                    // Resumption point outlived its range; clear it so the
                    // next unit observes exhaustion.
                    cursor.last_seen = None;
                    cursor.current_range = None;
                    return Ok(());
                }
            }
        } else {
            let current = cursor
                .current_range
                .as_ref()
                .expect("non-advancing unit has a current range");
            let last = cursor
                .last_seen
                .as_ref()
                .expect("non-advancing unit has a resumption point");
            let rest = current.continuation(last, shared.resume_granularity)?;
            cursor.current_range = Some(rest.clone());
            rest
        };
        let max_results = cfg.max_results as u64;
        let unit_cfg = UnitCfg {
            options: cfg.options.clone(),
            kind: cfg.kind,
            fair: cfg.fair,
            fairness_cap: (3 * max_results + 1) / 2,
        };
        (range, unit_cfg)
    };
    trace!(session = %shared.session_id, range = ?range, "fetch unit scanning");

    // Configure under the lease lock; a racing close() empties the slot and
    // the unit simply ends. The sequence is detached from the lease, so the
    // lock is not held across the drain.
    let sequence = {
        let mut held = shared.held.lock().expect("lease mutex poisoned");
        match held.as_mut() {
            Some(lease) => lease.configure(
                unit_cfg.kind,
                &shared.table,
                &shared.auths,
                &range,
                &unit_cfg.options,
            )?,
            None => return Ok(()),
        }
    };
    let mut sequence = sequence.peekable();

    // An immediately-empty scan ends the range.
    if sequence.peek().is_none() {
        cursor.last_seen = None;
        return Ok(());
    }

    if let Some(stats) = stats {
        stats.timer(TimerKind::ScannerIterate).resume();
    }
    let drained = drain(shared, sender, cursor, &unit_cfg, &mut sequence);
    if let Some(stats) = stats {
        stats.increment_keys_seen(*drained.as_ref().unwrap_or(&0));
        stats.timer(TimerKind::ScannerIterate).suspend();
    }
    drained.map(|_| ())
}

/// Moves entries from an open scan into the buffer until the scan ends, an
/// offer times out, the buffer fills, or the fairness cap is hit.
///
/// The resumption point advances only after a successful enqueue.
fn drain(
    shared: &Shared,
    sender: &Sender<Entry>,
    cursor: &mut Cursor,
    cfg: &UnitCfg,
    sequence: &mut impl Iterator<Item = Result<Entry>>,
) -> Result<u64> {
    let mut count: u64 = 0;
    for entry in sequence {
        let entry = entry?;
        let key = entry.key.clone();
        if sender.send_timeout(entry, shared.offer_timeout).is_err() {
            // Timed out or consumer gone; resume from the last accepted key.
            trace!(session = %shared.session_id, count, "offer yielded");
            break;
        }
        cursor.last_seen = Some(key);
        count += 1;
        if sender.is_full() {
            trace!(session = %shared.session_id, count, "buffer filled");
            break;
        }
        if cfg.fair && count >= cfg.fairness_cap {
            trace!(session = %shared.session_id, count, "fairness cap reached");
            break;
        }
    }
    Ok(count)
}
