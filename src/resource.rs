//! Pooled scan resources and the entry sequences they produce.
//!
//! # Design
//!
//! A [`ScanResource`] is a reusable slot that knows how to turn a
//! (table, auths, range) triple into a stream of entries against the backing
//! store. The resource itself is cheap; what the pool really meters is the
//! store-side scan concurrency, one open scan per checked-out resource.
//!
//! The scan strategy is a closed set: [`ResourceKind`] picks between a
//! `Live` sequence that streams lazily from the store and an `Offline`
//! sequence that materializes the whole range up front. `configure` is the
//! factory mapping the tag to the concrete variant.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::key::Entry;
use crate::range::ScanRange;
use crate::store::{AuthSet, EntryStream, ScanOptions, SortedStore, TableId};

// ==== Resource kind ====

/// Scan strategy a session requests from its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceKind {
    /// Stream entries lazily as the store serves them.
    #[default]
    Live,
    /// Materialize the full range at configure time, then iterate the copy.
    ///
    /// Useful against tables whose serving state may change mid-query: the
    /// copy is immune to the store going away partway through the drain.
    Offline,
}

// ==== Entry sequence ====

/// Entries produced by one configured scan.
///
/// `Live` defers to the store's stream; `Offline` walks a snapshot taken at
/// configure time. Either way iteration is detached from the resource that
/// created it, so releasing the resource does not invalidate the sequence.
pub enum EntrySequence {
    Live(Box<dyn EntryStream>),
    Offline(std::vec::IntoIter<Entry>),
}

impl Iterator for EntrySequence {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            EntrySequence::Live(stream) => stream.next(),
            EntrySequence::Offline(iter) => iter.next().map(Ok),
        }
    }
}

// ==== Scan resource ====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceState {
    Idle,
    Scanning,
}

/// One pooled slot for opening scans against the store.
pub struct ScanResource {
    store: Arc<dyn SortedStore>,
    state: ResourceState,
}

impl ScanResource {
    pub(crate) fn new(store: Arc<dyn SortedStore>) -> Self {
        Self {
            store,
            state: ResourceState::Idle,
        }
    }

    /// Opens a scan of `range`, returning the sequence for the chosen kind.
    ///
    /// A resource runs one scan per checkout; configuring twice without an
    /// intervening release is an [`Error::IllegalState`].
    pub fn configure(
        &mut self,
        kind: ResourceKind,
        table: &TableId,
        auths: &AuthSet,
        range: &ScanRange,
        options: &ScanOptions,
    ) -> Result<EntrySequence> {
        if self.state != ResourceState::Idle {
            return Err(Error::illegal_state("resource already configured"));
        }
        let stream = self.store.open_scan(table, auths, range, options)?;
        self.state = ResourceState::Scanning;
        match kind {
            ResourceKind::Live => Ok(EntrySequence::Live(stream)),
            ResourceKind::Offline => {
                let entries = stream.collect::<Result<Vec<Entry>>>()?;
                Ok(EntrySequence::Offline(entries.into_iter()))
            }
        }
    }

    /// Returns the resource to its idle, reusable state.
    pub(crate) fn reset(&mut self) {
        self.state = ResourceState::Idle;
    }
}
