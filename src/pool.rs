//! Fixed-capacity pool of scan resources.
//!
//! # Design
//!
//! The pool bounds store-side scan concurrency to a fixed `K` resources.
//! `acquire` blocks until a slot frees up; there is no try-acquire because
//! sessions have nothing useful to do without a resource. Checkout hands back
//! an RAII [`ResourceLease`] so a panicking or early-returning fetch unit can
//! never leak a slot.
//!
//! # Invariants
//!
//! - `free + outstanding == capacity` at all times.
//! - Returning more resources than were checked out is a caller bug and
//!   panics rather than silently inflating the pool.

use std::sync::{Arc, Condvar, Mutex};

use tracing::trace;

use crate::error::Result;
use crate::range::ScanRange;
use crate::resource::{EntrySequence, ResourceKind, ScanResource};
use crate::store::{AuthSet, ScanOptions, SortedStore, TableId};

struct PoolState {
    free: Vec<ScanResource>,
    outstanding: usize,
}

/// Blocking pool of [`ScanResource`]s over one backing store.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: usize,
}

impl ResourcePool {
    /// Builds a pool of `capacity` resources over `store`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; such a pool could never serve a scan.
    pub fn new(capacity: usize, store: Arc<dyn SortedStore>) -> Arc<Self> {
        assert!(capacity > 0, "resource pool capacity must be nonzero");
        let free = (0..capacity)
            .map(|_| ScanResource::new(Arc::clone(&store)))
            .collect();
        Arc::new(Self {
            state: Mutex::new(PoolState {
                free,
                outstanding: 0,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resources currently checked out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().expect("pool mutex poisoned").outstanding
    }

    /// Checks out a resource, blocking until one is free.
    #[must_use = "dropping the lease immediately returns the resource"]
    pub fn acquire(self: &Arc<Self>) -> ResourceLease {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        while state.free.is_empty() {
            state = self
                .available
                .wait(state)
                .expect("pool mutex poisoned");
        }
        let resource = state
            .free
            .pop()
            .expect("loop exits only with a free resource");
        state.outstanding += 1;
        trace!(outstanding = state.outstanding, "resource acquired");
        ResourceLease {
            pool: Arc::clone(self),
            resource: Some(resource),
        }
    }

    fn release(&self, mut resource: ScanResource) {
        resource.reset();
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if state.outstanding == 0 || state.free.len() >= self.capacity {
            // A second release of the same checkout would overfill the pool.
            panic!("resource released twice");
        }
        state.free.push(resource);
        state.outstanding -= 1;
        trace!(outstanding = state.outstanding, "resource released");
        self.available.notify_one();
    }
}

/// RAII checkout of one pool slot; dropping it releases the slot.
#[must_use = "holding the lease is what reserves the resource"]
pub struct ResourceLease {
    pool: Arc<ResourcePool>,
    resource: Option<ScanResource>,
}

impl ResourceLease {
    /// Opens a scan on the leased resource. See [`ScanResource::configure`].
    pub fn configure(
        &mut self,
        kind: ResourceKind,
        table: &TableId,
        auths: &AuthSet,
        range: &ScanRange,
        options: &ScanOptions,
    ) -> Result<EntrySequence> {
        self.resource
            .as_mut()
            .expect("lease holds its resource until drop")
            .configure(kind, table, auths, range, options)
    }

    /// Explicit release, equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}
