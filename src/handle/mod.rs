//! Data-handle management: the handle entity, its registry, access
//! arbitration, and the scoped per-session handle context.

mod access;
mod context;
#[allow(clippy::module_inception)]
mod handle;
mod registry;

pub use access::{AccessGuard, AcquireMode, Grant, ReleaseAction};
pub use context::{ContextGuard, SessionContext, SessionId};
pub use handle::{
    flags, Handle, HandleConfig, HandleKind, HandlePhase, HandleStatsSnapshot, METADATA_URI,
};
pub use registry::{HandleCursor, HandleRef, HandleRegistry, RegistryConfig, ResolveOptions};
