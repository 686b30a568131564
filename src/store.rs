//! Backing-store abstraction and an in-memory reference store.
//!
//! # Design
//!
//! [`SortedStore`] is the seam between sessions and whatever actually holds
//! the data: opening a scan yields a boxed [`EntryStream`], a fallible
//! iterator of entries in key order. Production deployments implement the
//! trait over their storage engine; [`MemoryStore`] is a `BTreeMap`-backed
//! implementation used by tests and small tools.
//!
//! Streams are fallible per item rather than per open so a store can surface
//! mid-scan failures (lost connection, server-side fault) exactly where they
//! occur; the session propagates the first such error to its failure sink.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::key::{Entry, Key};
use crate::range::ScanRange;

// ==== Identifiers ====

/// Name of the table a session scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId(String);

impl TableId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Visibility labels the scan is authorized to read.
///
/// Stored sorted and deduplicated so equal authorization sets compare equal
/// regardless of construction order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSet(BTreeSet<String>);

impl AuthSet {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Per-scan tuning knobs passed through to the store.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Entries the store should fetch per round trip.
    pub batch_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

// ==== Store traits ====

/// Fallible iterator of entries in ascending key order.
pub trait EntryStream: Iterator<Item = Result<Entry>> + Send {}

impl<T> EntryStream for T where T: Iterator<Item = Result<Entry>> + Send {}

/// A sorted key-value store that can open range scans.
pub trait SortedStore: Send + Sync {
    /// Opens a scan over `range`, returning entries in key order.
    fn open_scan(
        &self,
        table: &TableId,
        auths: &AuthSet,
        range: &ScanRange,
        options: &ScanOptions,
    ) -> Result<Box<dyn EntryStream>>;
}

// ==== In-memory store ====

/// `BTreeMap`-backed [`SortedStore`] for tests and small tools.
///
/// Scans snapshot the matching entries at open time; writes racing an open
/// scan are not reflected in it.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, BTreeMap<Key, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, creating the table if needed.
    pub fn put(&self, table: &TableId, key: Key, value: impl Into<Vec<u8>>) {
        let mut tables = self.tables.lock().expect("store mutex poisoned");
        tables
            .entry(table.as_str().to_owned())
            .or_default()
            .insert(key, value.into());
    }

    /// Number of entries currently in `table`.
    pub fn len(&self, table: &TableId) -> usize {
        let tables = self.tables.lock().expect("store mutex poisoned");
        tables.get(table.as_str()).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: &TableId) -> bool {
        self.len(table) == 0
    }
}

impl SortedStore for MemoryStore {
    fn open_scan(
        &self,
        table: &TableId,
        _auths: &AuthSet,
        range: &ScanRange,
        _options: &ScanOptions,
    ) -> Result<Box<dyn EntryStream>> {
        let tables = self.tables.lock().expect("store mutex poisoned");
        let data = tables
            .get(table.as_str())
            .ok_or_else(|| Error::Store(format!("no such table: {table}")))?;

        let start = if range.start_inclusive() {
            Bound::Included(range.start().clone())
        } else {
            Bound::Excluded(range.start().clone())
        };
        let end = if range.end_inclusive() {
            Bound::Included(range.end().clone())
        } else {
            Bound::Excluded(range.end().clone())
        };

        let entries: Vec<Entry> = data
            .range((start, end))
            .map(|(k, v)| Entry::new(k.clone(), v.clone()))
            .collect();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }
}
