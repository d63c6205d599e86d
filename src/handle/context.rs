//! Per-operation-thread scoped handle context.
//!
//! Every operation thread owns exactly one current-handle slot. Deeply
//! nested code discovers "the handle I am working on" through the slot
//! instead of threading it through every call frame. The guard returned
//! by [`SessionContext::bind`], [`clear`](SessionContext::clear), and
//! [`save`](SessionContext::save) restores the exact prior binding on
//! every exit path, including early return and unwind.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::handle::Handle;

/// Identity of an operation thread (session).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A session's identity plus its single current-handle slot.
///
/// The slot is a plain `RefCell`, so the context is `!Sync` and cannot be
/// shared across threads; each operation thread owns its own.
pub struct SessionContext {
    id: SessionId,
    current: RefCell<Option<Arc<Handle>>>,
}

impl SessionContext {
    /// Creates a context with an empty slot.
    pub fn new(id: SessionId) -> Self {
        SessionContext {
            id,
            current: RefCell::new(None),
        }
    }

    /// Session identity, used as the exclusive-owner tag and the
    /// statistics slot key.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The handle the in-flight operation is currently addressed
    /// against, if any.
    pub fn current(&self) -> Option<Arc<Handle>> {
        self.current.borrow().clone()
    }

    /// Binds the slot to `handle` until the guard drops.
    pub fn bind(&self, handle: Arc<Handle>) -> ContextGuard<'_> {
        let saved = self.current.replace(Some(handle));
        ContextGuard { ctx: self, saved }
    }

    /// Empties the slot until the guard drops, for work that must not
    /// see a leftover binding.
    pub fn clear(&self) -> ContextGuard<'_> {
        let saved = self.current.replace(None);
        ContextGuard { ctx: self, saved }
    }

    /// Preserves the current binding across a call that might reassign
    /// the slot, without imposing a different handle.
    pub fn save(&self) -> ContextGuard<'_> {
        let saved = self.current.borrow().clone();
        ContextGuard { ctx: self, saved }
    }
}

/// Restores the saved binding when dropped.
pub struct ContextGuard<'a> {
    ctx: &'a SessionContext,
    saved: Option<Arc<Handle>>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        *self.ctx.current.borrow_mut() = self.saved.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleConfig;

    fn handle(name: &str) -> Arc<Handle> {
        Arc::new(Handle::new(
            name.to_string(),
            0,
            None,
            HandleConfig::default(),
            0,
            0,
        ))
    }

    fn current_name(ctx: &SessionContext) -> Option<String> {
        ctx.current().map(|h| h.name().to_string())
    }

    #[test]
    fn bind_restores_previous_binding_not_none() {
        let ctx = SessionContext::new(SessionId(1));
        let a = handle("file:a");
        let b = handle("file:b");
        let _outer = ctx.bind(a);
        {
            let _inner = ctx.bind(b);
            assert_eq!(current_name(&ctx).as_deref(), Some("file:b"));
        }
        assert_eq!(current_name(&ctx).as_deref(), Some("file:a"));
    }

    #[test]
    fn deep_nesting_unwinds_in_order() {
        let ctx = SessionContext::new(SessionId(2));
        let names = ["file:0", "file:1", "file:2", "file:3"];
        fn descend(ctx: &SessionContext, names: &[&str]) {
            match names.split_first() {
                Some((first, rest)) => {
                    let _g = ctx.bind(handle(first));
                    assert_eq!(ctx.current().unwrap().name(), *first);
                    descend(ctx, rest);
                    assert_eq!(ctx.current().unwrap().name(), *first);
                }
                None => {}
            }
        }
        descend(&ctx, &names);
        assert!(ctx.current().is_none());
    }

    #[test]
    fn clear_hides_the_binding_then_restores_it() {
        let ctx = SessionContext::new(SessionId(3));
        let _outer = ctx.bind(handle("table:t"));
        {
            let _inner = ctx.clear();
            assert!(ctx.current().is_none());
        }
        assert_eq!(current_name(&ctx).as_deref(), Some("table:t"));
    }

    #[test]
    fn save_undoes_reassignment_by_the_callee() {
        let ctx = SessionContext::new(SessionId(4));
        let _outer = ctx.bind(handle("file:caller"));
        {
            let _saved = ctx.save();
            // Callee overwrites the slot without its own guard.
            *ctx.current.borrow_mut() = Some(handle("file:callee"));
            assert_eq!(current_name(&ctx).as_deref(), Some("file:callee"));
        }
        assert_eq!(current_name(&ctx).as_deref(), Some("file:caller"));
    }

    #[test]
    fn early_return_still_restores() {
        let ctx = SessionContext::new(SessionId(5));
        let _outer = ctx.bind(handle("file:outer"));
        fn inner(ctx: &SessionContext) -> Result<(), ()> {
            let _g = ctx.bind(handle("file:inner"));
            Err(())?;
            unreachable!()
        }
        assert!(inner(&ctx).is_err());
        assert_eq!(current_name(&ctx).as_deref(), Some("file:outer"));
    }

    #[test]
    fn panic_in_scope_restores_on_unwind() {
        let ctx = SessionContext::new(SessionId(6));
        let _outer = ctx.bind(handle("file:outer"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = ctx.bind(handle("file:doomed"));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(current_name(&ctx).as_deref(), Some("file:outer"));
    }
}
