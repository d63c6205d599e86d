//! Interface boundary to the underlying tree/table storage.
//!
//! The handle subsystem never interprets the objects it manages; it only
//! opens and closes them through [`DataSource`] and keeps the resulting
//! [`DataObject`] alive while the handle is open. The concrete storage
//! format lives behind this seam.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Result, TarnError};
use crate::handle::{HandleConfig, HandleKind};

/// An opened named data source (a tree or a table).
pub trait DataObject: Send + Sync {
    /// The kind of object behind this handle.
    fn kind(&self) -> HandleKind;

    /// Downcast seam for callers that know the concrete source.
    fn as_any(&self) -> &dyn Any;
}

/// Factory for opening and closing the objects handles wrap.
pub trait DataSource: Send + Sync {
    /// Opens the named object, optionally at a specific checkpoint.
    fn open(
        &self,
        name: &str,
        checkpoint: Option<&str>,
        kind: HandleKind,
        config: &HandleConfig,
    ) -> Result<Box<dyn DataObject>>;

    /// Tears down a previously opened object.
    fn close(&self, object: Box<dyn DataObject>) -> Result<()>;
}

/// In-memory data source used by tests and examples.
///
/// Counts opens and closes, and can be told to fail the next open to
/// exercise error paths.
#[derive(Default)]
pub struct MemorySource {
    opens: AtomicU64,
    closes: AtomicU64,
    fail_next_open: AtomicBool,
}

/// Object produced by [`MemorySource`].
pub struct MemoryObject {
    name: String,
    checkpoint: Option<String>,
    kind: HandleKind,
}

impl MemoryObject {
    /// Name the object was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checkpoint the object was opened at, if any.
    pub fn checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }
}

impl DataObject for MemoryObject {
    fn kind(&self) -> HandleKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MemorySource {
    /// Number of successful opens so far.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Number of closes so far.
    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Makes the next `open` fail with an invalid-state error.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::Relaxed);
    }
}

impl DataSource for MemorySource {
    fn open(
        &self,
        name: &str,
        checkpoint: Option<&str>,
        kind: HandleKind,
        _config: &HandleConfig,
    ) -> Result<Box<dyn DataObject>> {
        if self.fail_next_open.swap(false, Ordering::Relaxed) {
            return Err(TarnError::InvalidState("source open failure injected"));
        }
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryObject {
            name: name.to_string(),
            checkpoint: checkpoint.map(str::to_string),
            kind,
        }))
    }

    fn close(&self, object: Box<dyn DataObject>) -> Result<()> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        drop(object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_counts_opens_and_closes() -> Result<()> {
        let source = MemorySource::default();
        let obj = source.open("table:t", None, HandleKind::Table, &HandleConfig::default())?;
        assert_eq!(obj.kind(), HandleKind::Table);
        assert_eq!(source.open_count(), 1);
        source.close(obj)?;
        assert_eq!(source.close_count(), 1);
        Ok(())
    }

    #[test]
    fn injected_failure_hits_exactly_once() {
        let source = MemorySource::default();
        source.fail_next_open();
        assert!(source
            .open("file:a", None, HandleKind::Btree, &HandleConfig::default())
            .is_err());
        assert!(source
            .open("file:a", None, HandleKind::Btree, &HandleConfig::default())
            .is_ok());
    }
}
