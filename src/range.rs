//! Scan ranges and mid-range continuation.
//!
//! # Design
//!
//! A [`ScanRange`] is a contiguous span of keys with independently inclusive
//! or exclusive endpoints. Sessions hold their pending ranges sorted by start
//! key, so `ScanRange` carries a total order keyed on the start endpoint.
//!
//! Continuation is the one non-obvious operation: after a drain stops partway
//! through a range, the remainder is `[successor(last), end]` where the
//! successor is built at a configurable [`KeyGranularity`]. When the successor
//! already lies past the end there is nothing left, which surfaces as
//! [`Error::EmptyRange`] and is treated by callers as the normal end-of-range
//! signal.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};
use crate::key::{Key, KeyGranularity};

/// A contiguous span of keys with per-endpoint inclusivity.
#[derive(Clone, PartialEq, Eq)]
pub struct ScanRange {
    start: Key,
    start_inclusive: bool,
    end: Key,
    end_inclusive: bool,
}

impl ScanRange {
    /// Builds a range, rejecting one whose start lies past its end.
    pub fn new(
        start: Key,
        start_inclusive: bool,
        end: Key,
        end_inclusive: bool,
    ) -> Result<Self> {
        if start > end {
            return Err(Error::EmptyRange { start, end });
        }
        Ok(Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
        })
    }

    /// Inclusive-both-ends convenience constructor.
    pub fn closed(start: Key, end: Key) -> Result<Self> {
        Self::new(start, true, end, true)
    }

    /// Range covering exactly one key.
    pub fn exact(key: Key) -> Self {
        Self {
            start: key.clone(),
            start_inclusive: true,
            end: key,
            end_inclusive: true,
        }
    }

    pub fn start(&self) -> &Key {
        &self.start
    }

    pub fn end(&self) -> &Key {
        &self.end
    }

    pub fn start_inclusive(&self) -> bool {
        self.start_inclusive
    }

    pub fn end_inclusive(&self) -> bool {
        self.end_inclusive
    }

    /// Whether `key` falls within this range.
    pub fn contains(&self, key: &Key) -> bool {
        let after_start = match key.cmp(&self.start) {
            Ordering::Less => false,
            Ordering::Equal => self.start_inclusive,
            Ordering::Greater => true,
        };
        let before_end = match key.cmp(&self.end) {
            Ordering::Less => true,
            Ordering::Equal => self.end_inclusive,
            Ordering::Greater => false,
        };
        after_start && before_end
    }

    /// Builds the remainder of `self` after `last` was handed out.
    ///
    /// The remainder starts inclusively at the successor of `last` at the
    /// given granularity and keeps this range's end endpoint unchanged.
    /// Returns [`Error::EmptyRange`] when the successor lies past the end,
    /// meaning the range is exhausted.
    pub fn continuation(&self, last: &Key, granularity: KeyGranularity) -> Result<ScanRange> {
        ScanRange::new(
            last.following(granularity),
            true,
            self.end.clone(),
            self.end_inclusive,
        )
    }
}

// Ordered by start key, inclusive starts first, then by end.
impl Ord for ScanRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| other.start_inclusive.cmp(&self.start_inclusive))
            .then_with(|| self.end.cmp(&other.end))
            .then_with(|| self.end_inclusive.cmp(&other.end_inclusive))
    }
}

impl PartialOrd for ScanRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.start_inclusive { '[' } else { '(' };
        let close = if self.end_inclusive { ']' } else { ')' };
        write!(f, "{open}{} .. {}{close}", self.start, self.end)
    }
}
