//! Crate-wide error type.
//!
//! # Design
//!
//! Errors are `Clone` on purpose: a producer failure is recorded once in a
//! [`FailureCell`](crate::failure::FailureCell) and then re-surfaced on every
//! subsequent consumer call, so the same error value must be handed out more
//! than once. Variants that wrap foreign errors carry the rendered message
//! rather than the source to keep that property.

use thiserror::Error;

use crate::key::Key;

/// Canonical result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Range construction landed with a start past the end.
    ///
    /// When this arises from continuation-range building inside a fetch unit
    /// it is the *expected* end-of-range signal, not a failure: the session
    /// clears its resumption point and moves to the next range.
    #[error("empty range: start {start} lies past end {end}")]
    EmptyRange { start: Key, end: Key },

    /// A lifecycle method was called in a state that forbids it
    /// (e.g. replacing the range backlog while the session is running).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The backing store failed while opening or iterating a scan.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid construction-time configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for an [`Error::IllegalState`] with a formatted message.
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }
}
