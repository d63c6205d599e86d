//! Crate-wide error taxonomy.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TarnError>;

/// Errors surfaced by the handle subsystem.
///
/// `Busy` is always recoverable by retrying or backing off at a higher
/// level; it is never retried internally. Structural invariant violations
/// (reference underflow, cursor misuse) are debug assertions, not error
/// values.
#[derive(Debug, Error)]
pub enum TarnError {
    /// An exclusive (or lock-only) acquisition could not be granted
    /// immediately because of conflicting holders.
    #[error("resource busy")]
    Busy,
    /// Name resolution failed and creation was not requested.
    #[error("not found")]
    NotFound,
    /// The operation assumed an open or reopenable handle but found it
    /// inactive, dropped, or dead.
    #[error("invalid handle state: {0}")]
    InvalidState(&'static str),
    /// An error from the underlying data source.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
}

impl TarnError {
    /// True if the caller may retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TarnError::Busy)
    }
}
