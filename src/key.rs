//! Sorted-store keys and byte-wise successor construction.
//!
//! # Design
//!
//! A [`Key`] is the three-part coordinate of an entry in the store: row,
//! column family, column qualifier, each an opaque byte string. Keys order
//! lexicographically by component, row first. The store sorts entries by this
//! order, and range scans resume from a key's *successor*: the smallest key
//! strictly greater than it at a chosen [`KeyGranularity`]. The successor is
//! built by appending a single `0x00` byte to the chosen component, which is
//! the tightest strictly-greater key under byte-wise ordering.
//!
//! # Invariants
//!
//! - `k < k.following(g)` for every key `k` and granularity `g`.
//! - No key with the same prefix sorts between `k` and `k.following(g)`.

use std::fmt;

// ==== Granularity ====

/// Component depth at which a successor key is built.
///
/// `Qualifier` is the finest granularity and the default resumption depth:
/// it skips exactly the entry last handed out and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyGranularity {
    /// Successor of the row: skips every remaining entry in the row.
    Row,
    /// Successor of (row, family): skips the rest of the family.
    Family,
    /// Successor of the full key: skips only the key itself.
    #[default]
    Qualifier,
}

// ==== Key ====

/// Three-part coordinate of an entry in the sorted store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key {
    row: Vec<u8>,
    family: Vec<u8>,
    qualifier: Vec<u8>,
}

impl Key {
    /// Builds a key from its three components.
    pub fn new(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }

    /// Builds a key with only a row component.
    pub fn from_row(row: impl Into<Vec<u8>>) -> Self {
        Self::new(row, Vec::new(), Vec::new())
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn family(&self) -> &[u8] {
        &self.family
    }

    pub fn qualifier(&self) -> &[u8] {
        &self.qualifier
    }

    /// Returns the smallest key strictly greater than `self` at the given
    /// granularity.
    ///
    /// Components finer than the granularity are cleared, so the successor is
    /// positioned at the very start of the next row/family/key.
    pub fn following(&self, granularity: KeyGranularity) -> Key {
        let mut next = self.clone();
        match granularity {
            KeyGranularity::Row => {
                next.row.push(0x00);
                next.family.clear();
                next.qualifier.clear();
            }
            KeyGranularity::Family => {
                next.family.push(0x00);
                next.qualifier.clear();
            }
            KeyGranularity::Qualifier => {
                next.qualifier.push(0x00);
            }
        }
        next
    }
}

fn fmt_component(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for &b in bytes {
        match b {
            b' '..=b'~' => write!(f, "{}", b as char)?,
            _ => write!(f, "\\x{b:02x}")?,
        }
    }
    Ok(())
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_component(f, &self.row)?;
        write!(f, ":")?;
        fmt_component(f, &self.family)?;
        write!(f, ":")?;
        fmt_component(f, &self.qualifier)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

// ==== Entry ====

/// Opaque stored payload.
pub type Value = Vec<u8>;

/// A key paired with its stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
}

impl Entry {
    pub fn new(key: Key, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}
