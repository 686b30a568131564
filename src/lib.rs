//! Windowed range-scan sessions over a sorted key-value store.
//!
//! The store serves entries in key order; consumers want a plain iterator.
//! This crate bridges the two without letting any single consumer pin a
//! store-side scanner for its whole lifetime:
//!
//! - [`ScanSession`] runs a producer thread that works through a backlog of
//!   key ranges in short *fetch units*, buffering results for a blocking
//!   `has_next`/`next_entry` consumer surface.
//! - [`ResourcePool`] bounds store-side scan concurrency to a fixed number
//!   of slots; a session checks a slot out per fetch unit and releases it
//!   between units, so many sessions can share a small pool.
//! - Progress is a resumption key, not an open cursor: each fetch unit
//!   reopens the scan from the successor of the last buffered key, so
//!   entries arrive exactly once in order across arbitrarily many units.
//! - [`ReadAhead`] is an optional downstream stage that merges and filters
//!   results on another thread ahead of the consumer.
//!
//! Producer failures are parked in a [`FailureCell`] and surfaced by the
//! consumer only after every already-buffered entry has been delivered.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rangescan::{
//!     AuthSet, Key, MemoryStore, ResourcePool, ScanRange, ScanSession,
//!     SessionConfig, TableId,
//! };
//!
//! # fn main() -> rangescan::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let table = TableId::from("shard");
//! for row in ["a", "b", "c"] {
//!     store.put(&table, Key::from_row(row), row);
//! }
//!
//! let pool = ResourcePool::new(4, store);
//! let range = ScanRange::closed(Key::from_row("a"), Key::from_row("c"))?;
//! let session = ScanSession::with_ranges(
//!     table,
//!     AuthSet::default(),
//!     pool,
//!     SessionConfig::default(),
//!     vec![range],
//! )?;
//!
//! let rows: Vec<Vec<u8>> = session
//!     .map(|entry| entry.map(|e| e.key.row().to_vec()))
//!     .collect::<rangescan::Result<_>>()?;
//! assert_eq!(rows, [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod failure;
pub mod key;
pub mod listener;
pub mod pool;
pub mod range;
pub mod readahead;
pub mod resource;
pub mod session;
pub mod stats;
pub mod store;

pub use error::{Error, Result};
pub use failure::FailureCell;
pub use key::{Entry, Key, KeyGranularity, Value};
pub use listener::{ServiceListener, StatsListener};
pub use pool::{ResourceLease, ResourcePool};
pub use range::ScanRange;
pub use readahead::{FilterFn, MergeFn, ReadAhead, ReadAheadConfig};
pub use resource::{EntrySequence, ResourceKind, ScanResource};
pub use session::{ScanSession, SessionConfig};
pub use stats::{PausableTimer, ScanSessionStats, StatsSnapshot, TimerKind};
pub use store::{AuthSet, EntryStream, MemoryStore, ScanOptions, SortedStore, TableId};
