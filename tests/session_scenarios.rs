//! End-to-end session scenarios against instrumented stores.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use rangescan::{
    AuthSet, Entry, Error, EntryStream, Key, MemoryStore, ResourcePool, Result, ScanOptions,
    ScanRange, ScanSession, ScanSessionStats, ServiceListener, SessionConfig, SortedStore,
    TableId, TimerKind,
};

// ==== Instrumented stores ====

/// Per-open record: the range requested and how many entries the returned
/// stream actually served.
struct OpenRecord {
    range: ScanRange,
    served: Arc<AtomicU64>,
}

/// Wraps a [`MemoryStore`] and records every `open_scan`.
struct RecordingStore {
    inner: MemoryStore,
    opens: Mutex<Vec<OpenRecord>>,
}

impl RecordingStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            opens: Mutex::new(Vec::new()),
        }
    }

    fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    /// (start key, entries served) per open, in open order.
    fn summaries(&self) -> Vec<(Key, u64)> {
        self.opens
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.range.start().clone(), r.served.load(Ordering::SeqCst)))
            .collect()
    }
}

struct CountingStream {
    inner: Box<dyn EntryStream>,
    served: Arc<AtomicU64>,
}

impl Iterator for CountingStream {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next();
        if item.is_some() {
            self.served.fetch_add(1, Ordering::SeqCst);
        }
        item
    }
}

impl SortedStore for RecordingStore {
    fn open_scan(
        &self,
        table: &TableId,
        auths: &AuthSet,
        range: &ScanRange,
        options: &ScanOptions,
    ) -> Result<Box<dyn EntryStream>> {
        let stream = self.inner.open_scan(table, auths, range, options)?;
        let served = Arc::new(AtomicU64::new(0));
        self.opens.lock().unwrap().push(OpenRecord {
            range: range.clone(),
            served: Arc::clone(&served),
        });
        Ok(Box::new(CountingStream {
            inner: stream,
            served,
        }))
    }
}

/// Serves `ok_before_failure` entries, then fails the stream mid-scan.
struct FlakyStore {
    ok_before_failure: usize,
}

impl SortedStore for FlakyStore {
    fn open_scan(
        &self,
        _table: &TableId,
        _auths: &AuthSet,
        _range: &ScanRange,
        _options: &ScanOptions,
    ) -> Result<Box<dyn EntryStream>> {
        let items: Vec<Result<Entry>> = (0..self.ok_before_failure)
            .map(|i| {
                let row = format!("row{i:04}");
                Ok(Entry::new(Key::from_row(row.as_str()), row.as_str()))
            })
            .chain(std::iter::once(Err(Error::Store(
                "synthetic mid-scan disconnect".into(),
            ))))
            .collect();
        Ok(Box::new(items.into_iter()))
    }
}

/// Serves one entry, then blocks until the gate is released and fails.
///
/// Lets a test park a fetch unit mid-drain and choose exactly when the
/// store-side failure happens relative to other session calls.
struct GatedStream {
    first: Option<Entry>,
    gate: mpsc::Receiver<()>,
    failed: bool,
}

impl Iterator for GatedStream {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.first.take() {
            return Some(Ok(entry));
        }
        if self.failed {
            return None;
        }
        self.failed = true;
        let _ = self.gate.recv();
        Some(Err(Error::Store("store went away mid-scan".into())))
    }
}

struct GatedStore {
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl SortedStore for GatedStore {
    fn open_scan(
        &self,
        _table: &TableId,
        _auths: &AuthSet,
        _range: &ScanRange,
        _options: &ScanOptions,
    ) -> Result<Box<dyn EntryStream>> {
        match self.gate.lock().unwrap().take() {
            Some(gate) => Ok(Box::new(GatedStream {
                first: Some(Entry::new(Key::from_row("a"), "a")),
                gate,
                failed: false,
            })),
            None => Ok(Box::new(std::iter::empty::<Result<Entry>>())),
        }
    }
}

// ==== Listener probe ====

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ServiceListener for EventLog {
    fn starting(&self) {
        self.events.lock().unwrap().push("starting".into());
    }

    fn stopping(&self) {
        self.events.lock().unwrap().push("stopping".into());
    }

    fn failed(&self, session_id: &str, _cause: &Error) {
        self.events
            .lock()
            .unwrap()
            .push(format!("failed:{session_id}"));
    }
}

// ==== Helpers ====

fn seeded_memory(rows: usize) -> (MemoryStore, TableId) {
    let store = MemoryStore::new();
    let table = TableId::from("shard");
    for i in 0..rows {
        let row = format!("row{i:04}");
        store.put(&table, Key::from_row(row.as_str()), row.as_str());
    }
    (store, table)
}

fn full_range() -> ScanRange {
    ScanRange::closed(Key::from_row("row0000"), Key::from_row("row9999")).unwrap()
}

fn quick_config(max_results: usize) -> SessionConfig {
    SessionConfig {
        max_results,
        poll_timeout: Duration::from_millis(100),
        offer_timeout: Duration::from_millis(20),
        ..SessionConfig::default()
    }
}

fn collect_rows(session: ScanSession) -> Vec<Vec<u8>> {
    session
        .map(|e| e.expect("scenario seeds no failure").key.row().to_vec())
        .collect()
}

// ==== Scenarios ====

#[test]
fn fair_session_resumes_across_many_short_scans() {
    let (memory, table) = seeded_memory(40);
    let store = Arc::new(RecordingStore::new(memory));
    let pool = ResourcePool::new(1, Arc::clone(&store) as Arc<dyn SortedStore>);

    // A roomy offer timeout keeps every unit from yielding empty-handed if
    // the consumer stalls, so continuation starts advance deterministically.
    let mut config = quick_config(4);
    config.offer_timeout = Duration::from_millis(500);
    let session = ScanSession::with_ranges(
        table,
        AuthSet::default(),
        pool,
        config,
        vec![full_range()],
    )
    .unwrap();

    let rows = collect_rows(session);
    assert_eq!(rows.len(), 40, "every entry delivered exactly once");
    assert!(rows.windows(2).all(|w| w[0] < w[1]), "out of order");

    let summaries = store.summaries();
    assert!(summaries.len() > 1, "fair session must reopen the scan");

    // Fairness cap: ceil(1.5 * 4) = 6. A stream may serve one entry past
    // the enqueue count when the final offer times out.
    for (start, served) in &summaries {
        assert!(*served <= 7, "open at {start} served {served} entries");
    }

    // Each reopen starts strictly past the previous one.
    assert!(
        summaries.windows(2).all(|w| w[0].0 < w[1].0),
        "continuation starts must advance"
    );

    // Continuation starts are successor keys of delivered entries.
    for (start, _) in &summaries[1..] {
        assert!(
            start.qualifier().ends_with(&[0x00]),
            "continuation start {start} is not a successor key"
        );
    }
}

#[test]
fn unfair_session_with_roomy_buffer_scans_once() {
    let (memory, table) = seeded_memory(40);
    let store = Arc::new(RecordingStore::new(memory));
    let pool = ResourcePool::new(1, Arc::clone(&store) as Arc<dyn SortedStore>);

    let mut session = ScanSession::with_ranges(
        table,
        AuthSet::default(),
        pool,
        quick_config(100),
        vec![full_range()],
    )
    .unwrap();
    session.set_fairness(false);

    let rows = collect_rows(session);
    assert_eq!(rows.len(), 40);

    // One open drains everything; a second open may observe the empty
    // remainder before the session notices exhaustion.
    let summaries = store.summaries();
    assert_eq!(summaries[0].1, 40, "single drain expected");
    assert!(summaries[1..].iter().all(|(_, served)| *served == 0));
}

#[test]
fn buffered_entries_drain_before_failure_surfaces() {
    let store = Arc::new(FlakyStore {
        ok_before_failure: 5,
    });
    let pool = ResourcePool::new(1, store as Arc<dyn SortedStore>);

    let log = Arc::new(EventLog::default());
    let stats = Arc::new(ScanSessionStats::new());
    let mut session = ScanSession::with_ranges(
        TableId::from("shard"),
        AuthSet::default(),
        pool,
        SessionConfig {
            session_id: "flaky".into(),
            ..quick_config(10)
        },
        vec![full_range()],
    )
    .unwrap();
    session.add_listener(Arc::clone(&log) as Arc<dyn ServiceListener>);
    session.apply_stats(Arc::clone(&stats)).unwrap();

    let mut delivered = 0;
    let failure = loop {
        match session.has_next() {
            Ok(true) => {
                session.next_entry().unwrap();
                delivered += 1;
            }
            Ok(false) => panic!("session ended without surfacing the failure"),
            Err(err) => break err,
        }
    };

    assert_eq!(delivered, 5, "buffered entries drain before the error");
    assert!(matches!(failure, Error::Store(_)));

    // The failure stays armed for later calls.
    assert!(session.has_next().is_err());
    assert!(session.next_entry().is_err());

    let events = log.events();
    assert_eq!(events.first().map(String::as_str), Some("starting"));
    assert!(events.contains(&"failed:flaky".to_string()));
    assert!(!events.contains(&"stopping".to_string()));

    // The stats listener froze every timer.
    for kind in TimerKind::ALL {
        assert!(!stats.timer(kind).is_running(), "{kind:?} still running");
    }
}

#[test]
fn close_swallows_failure_from_the_abandoned_fetch() {
    let (release_gate, gate) = mpsc::channel();
    let store = Arc::new(GatedStore {
        gate: Mutex::new(Some(gate)),
    });
    let pool = ResourcePool::new(1, store as Arc<dyn SortedStore>);

    let mut session = ScanSession::with_ranges(
        TableId::from("shard"),
        AuthSet::default(),
        Arc::clone(&pool),
        quick_config(2),
        vec![full_range()],
    )
    .unwrap();
    let sink = session.failure_sink();

    // First entry arrives; the fetch unit is now parked inside the store
    // stream waiting on the gate.
    assert!(session.has_next().unwrap());
    session.close();

    // Let the abandoned unit hit its store failure after the close.
    let _ = release_gate.send(());

    // The staged entry still delivers, then the session ends cleanly: the
    // in-flight failure never reaches the consumer.
    assert_eq!(
        session.next_entry().unwrap().unwrap().key,
        Key::from_row("a")
    );
    assert!(!session.has_next().unwrap());
    assert!(session.next_entry().unwrap().is_none());

    // Joining the producer proves the unit finished without arming the sink.
    drop(session);
    assert!(!sink.is_armed());
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn lifecycle_listeners_fire_in_order_on_success() {
    let (memory, table) = seeded_memory(8);
    let pool = ResourcePool::new(1, Arc::new(memory) as Arc<dyn SortedStore>);

    let log = Arc::new(EventLog::default());
    let mut session = ScanSession::with_ranges(
        table,
        AuthSet::default(),
        pool,
        quick_config(10),
        vec![full_range()],
    )
    .unwrap();
    session.add_listener(Arc::clone(&log) as Arc<dyn ServiceListener>);

    let rows = collect_rows(session);
    assert_eq!(rows.len(), 8);
    assert_eq!(log.events(), ["starting", "stopping"]);
}

#[test]
fn two_sessions_share_a_single_pool_slot() {
    let (memory, table) = seeded_memory(30);
    let store = Arc::new(memory);
    let pool = ResourcePool::new(1, Arc::clone(&store) as Arc<dyn SortedStore>);

    let lower =
        ScanRange::closed(Key::from_row("row0000"), Key::from_row("row0014")).unwrap();
    let upper =
        ScanRange::closed(Key::from_row("row0015"), Key::from_row("row9999")).unwrap();

    let mut first = ScanSession::with_ranges(
        table.clone(),
        AuthSet::default(),
        Arc::clone(&pool),
        quick_config(4),
        vec![lower],
    )
    .unwrap();
    let mut second = ScanSession::with_ranges(
        table,
        AuthSet::default(),
        pool,
        quick_config(4),
        vec![upper],
    )
    .unwrap();

    // Interleave the two consumers; resources are only held within a fetch
    // unit, so neither session can starve the other.
    let mut first_rows = Vec::new();
    let mut second_rows = Vec::new();
    loop {
        let mut progressed = false;
        if first.has_next().unwrap() {
            first_rows.push(first.next_entry().unwrap().unwrap().key.row().to_vec());
            progressed = true;
        }
        if second.has_next().unwrap() {
            second_rows.push(second.next_entry().unwrap().unwrap().key.row().to_vec());
            progressed = true;
        }
        if !progressed {
            break;
        }
    }

    assert_eq!(first_rows.len(), 15);
    assert_eq!(second_rows.len(), 15);
    assert!(first_rows.windows(2).all(|w| w[0] < w[1]));
    assert!(second_rows.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn qualifier_granularity_never_skips_row_siblings() {
    // Multiple entries per row: resuming at qualifier granularity must pick
    // up the remaining families of a row split across fetch units.
    let store = MemoryStore::new();
    let table = TableId::from("shard");
    let mut expected = 0;
    for i in 0..10 {
        for fam in ["a", "b", "c"] {
            let row = format!("row{i:02}");
            store.put(&table, Key::new(row.as_str(), fam, ""), fam);
            expected += 1;
        }
    }
    let pool = ResourcePool::new(1, Arc::new(store) as Arc<dyn SortedStore>);
    let range = ScanRange::closed(Key::from_row("row00"), Key::from_row("row99")).unwrap();
    let session = ScanSession::with_ranges(
        table,
        AuthSet::default(),
        pool,
        quick_config(2),
        vec![range],
    )
    .unwrap();

    let keys: Vec<Key> = session
        .map(|e| e.expect("scenario seeds no failure").key)
        .collect();
    assert_eq!(keys.len(), expected);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn stats_attribute_time_across_the_session() {
    let (memory, table) = seeded_memory(20);
    let pool = ResourcePool::new(1, Arc::new(memory) as Arc<dyn SortedStore>);
    let stats = Arc::new(ScanSessionStats::new());

    let mut session = ScanSession::with_ranges(
        table,
        AuthSet::default(),
        pool,
        quick_config(4),
        vec![full_range()],
    )
    .unwrap();
    session.apply_stats(Arc::clone(&stats)).unwrap();

    let rows = collect_rows(session);
    assert_eq!(rows.len(), 20);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.keys_seen, 20);
    assert!(snapshot.runtime >= snapshot.scanner_iterate);
    assert!(snapshot.scanner_start >= snapshot.scanner_iterate);
}
