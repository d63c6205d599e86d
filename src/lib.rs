//! Tarn — the data-handle management core of an embedded storage engine.
//!
//! Tarn tracks every open named data source (a table or its underlying
//! tree), arbitrates concurrent shared/exclusive access to it, and
//! governs its lifecycle from first open through idle eviction to final
//! destruction. The storage format itself lives behind the
//! [`source::DataSource`] trait; this crate only manages the handles
//! that wrap it.
//!
//! ```
//! use std::sync::Arc;
//! use tarn::{
//!     AcquireMode, HandleRegistry, MemorySource, ResolveOptions, SessionContext, SessionId,
//! };
//!
//! # fn main() -> tarn::Result<()> {
//! let registry = HandleRegistry::new(Arc::new(MemorySource::default()));
//! let session = SessionContext::new(SessionId(1));
//!
//! let table = registry.resolve(&session, "table:orders", None, ResolveOptions::create())?;
//! let access = table.acquire(&session, AcquireMode::Shared)?;
//!
//! // Nested code finds the handle through the session's scoped slot.
//! let _scope = session.bind(table.handle().clone());
//! assert_eq!(session.current().unwrap().name(), "table:orders");
//!
//! drop(access);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handle;
pub mod source;

pub use error::{Result, TarnError};
pub use handle::{
    flags, AccessGuard, AcquireMode, ContextGuard, Grant, Handle, HandleConfig, HandleCursor,
    HandleKind, HandlePhase, HandleRef, HandleRegistry, HandleStatsSnapshot, RegistryConfig,
    ReleaseAction, ResolveOptions, SessionContext, SessionId, METADATA_URI,
};
pub use source::{DataObject, DataSource, MemoryObject, MemorySource};
