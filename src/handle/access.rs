//! Shared/exclusive access arbitration over a handle's rwlock.
//!
//! Shared acquisition blocks like any read lock; exclusive acquisition
//! never blocks — an unavailable lock or a non-zero in-use count fails
//! busy immediately, and callers retry at a higher level. Exclusive
//! holds are reentrant for the owning session.

use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};
use tracing::trace;

use crate::error::{Result, TarnError};
use crate::handle::context::{SessionContext, SessionId};
use crate::handle::handle::{Handle, HandlePhase};
use crate::handle::registry::{HandleRef, RegistryShared};

/// How a caller wants to hold a handle.
///
/// The lock-only modes take the lock without requiring (or opening) the
/// underlying resource: they exist to keep other users out, not to use
/// the object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcquireMode {
    /// Concurrent use of the open resource alongside other readers.
    Shared,
    /// Sole use of the open resource; fails busy rather than waiting.
    Exclusive,
    /// Lock without the resource: shared if the handle is already open,
    /// otherwise exclusive.
    LockOnlyShared,
    /// Lock without the resource: always exclusive or busy.
    LockOnlyExclusive,
}

/// Which lock an acquisition actually granted. Lock-only shared requests
/// may legitimately come back exclusive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Grant {
    /// Read side of the handle lock.
    Shared,
    /// Write side of the handle lock.
    Exclusive,
}

/// Release-time policy for the underlying resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReleaseAction {
    /// Leave the resource as it is.
    Retain,
    /// Close the resource once nothing uses it; the struct is retained
    /// for cheap reopen.
    Discard,
    /// Close the resource and mark the handle dead.
    DiscardKill,
}

impl HandleRef {
    /// Acquires shared or exclusive access per `mode`.
    ///
    /// Releasing is by dropping the returned guard, or by
    /// [`AccessGuard::release_with`] to attach a discard policy.
    pub fn acquire(&self, session: &SessionContext, mode: AcquireMode) -> Result<AccessGuard> {
        match mode {
            AcquireMode::Shared => acquire_shared(self, session),
            AcquireMode::Exclusive => acquire_exclusive(self, session, false),
            AcquireMode::LockOnlyShared => {
                if self.is_open() {
                    acquire_lock_only_shared(self, session)
                } else {
                    acquire_exclusive(self, session, true)
                }
            }
            AcquireMode::LockOnlyExclusive => acquire_exclusive(self, session, true),
        }
    }
}

fn acquire_shared(href: &HandleRef, session: &SessionContext) -> Result<AccessGuard> {
    let handle = Arc::clone(href.handle());
    let shared = Arc::clone(href.shared());
    let read_guard = loop {
        if handle.is_open() {
            let rg = handle.access().read_arc();
            // The handle may have been closed or killed while we waited.
            if handle.is_open() {
                break rg;
            }
            drop(rg);
            continue;
        }
        // Open under the write lock and downgrade, so no exclusive can
        // slip in between the open and the shared grant.
        if let Some(wg) = handle.access().try_write_arc() {
            match shared.open_object(session, &handle) {
                Ok(()) => break ArcRwLockWriteGuard::downgrade(wg),
                Err(err) => {
                    drop(wg);
                    return Err(err);
                }
            }
        }
        // Lock held elsewhere; wait for a potential opener and re-check.
        let rg = handle.access().read_arc();
        if handle.is_open() {
            break rg;
        }
        drop(rg);
        return Err(TarnError::Busy);
    };
    if handle.is_dropped() {
        return Err(TarnError::InvalidState("handle is dropped"));
    }
    handle.incr_in_use();
    handle.stats().record_shared(session.id());
    trace!(name = %handle.name(), session = %session.id(), "access.shared");
    Ok(AccessGuard {
        handle,
        shared,
        owner: session.id(),
        grant: Grant::Shared,
        lock_only: false,
        counted: true,
        read_guard: Some(read_guard),
        released: false,
    })
}

fn acquire_lock_only_shared(href: &HandleRef, session: &SessionContext) -> Result<AccessGuard> {
    let handle = Arc::clone(href.handle());
    let shared = Arc::clone(href.shared());
    let read_guard = handle.access().read_arc();
    if !handle.is_open() {
        // Closed while we waited for the lock; fall back to exclusive.
        drop(read_guard);
        return acquire_exclusive(href, session, true);
    }
    handle.state().lock_only_holds += 1;
    handle.stats().record_shared(session.id());
    trace!(name = %handle.name(), session = %session.id(), "access.lock_only_shared");
    Ok(AccessGuard {
        handle,
        shared,
        owner: session.id(),
        grant: Grant::Shared,
        lock_only: true,
        counted: false,
        read_guard: Some(read_guard),
        released: false,
    })
}

fn acquire_exclusive(
    href: &HandleRef,
    session: &SessionContext,
    lock_only: bool,
) -> Result<AccessGuard> {
    let handle = Arc::clone(href.handle());
    let shared = Arc::clone(href.shared());
    {
        let mut st = handle.state();
        if st.excl_owner == Some(session.id()) {
            // Reentrant hold by the current owner.
            st.excl_depth += 1;
            if lock_only {
                st.lock_only_holds += 1;
            }
            drop(st);
            if !lock_only {
                handle.incr_in_use();
            }
            handle.stats().record_exclusive(session.id());
            trace!(name = %handle.name(), session = %session.id(), "access.exclusive.reentrant");
            return Ok(AccessGuard {
                handle,
                shared,
                owner: session.id(),
                grant: Grant::Exclusive,
                lock_only,
                counted: !lock_only,
                read_guard: None,
                released: false,
            });
        }
        if st.phase == HandlePhase::Dead {
            return Err(TarnError::InvalidState("handle is dead"));
        }
        if st.dropped {
            return Err(TarnError::InvalidState("handle is dropped"));
        }
    }
    let write_guard = match handle.access().try_write_arc() {
        Some(g) => g,
        None => {
            handle.stats().record_busy(session.id());
            trace!(name = %handle.name(), session = %session.id(), "access.busy");
            return Err(TarnError::Busy);
        }
    };
    if handle.in_use() > 0 {
        drop(write_guard);
        handle.stats().record_busy(session.id());
        trace!(name = %handle.name(), session = %session.id(), "access.busy");
        return Err(TarnError::Busy);
    }
    if !lock_only && !handle.is_open() {
        if let Err(err) = shared.open_object(session, &handle) {
            drop(write_guard);
            return Err(err);
        }
    }
    {
        let mut st = handle.state();
        if st.phase == HandlePhase::Dead {
            drop(st);
            drop(write_guard);
            return Err(TarnError::InvalidState("handle is dead"));
        }
        st.excl_owner = Some(session.id());
        st.excl_depth = 1;
        st.excl_guard = Some(write_guard);
        if lock_only {
            st.lock_only_holds += 1;
        }
    }
    if !lock_only {
        handle.incr_in_use();
    }
    handle.stats().record_exclusive(session.id());
    trace!(name = %handle.name(), session = %session.id(), lock_only, "access.exclusive");
    Ok(AccessGuard {
        handle,
        shared,
        owner: session.id(),
        grant: Grant::Exclusive,
        lock_only,
        counted: !lock_only,
        read_guard: None,
        released: false,
    })
}

/// A held shared or exclusive grant. Dropping the guard releases it with
/// [`ReleaseAction::Retain`].
pub struct AccessGuard {
    handle: Arc<Handle>,
    shared: Arc<RegistryShared>,
    owner: SessionId,
    grant: Grant,
    lock_only: bool,
    counted: bool,
    read_guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
    released: bool,
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("owner", &self.owner)
            .field("grant", &self.grant)
            .field("lock_only", &self.lock_only)
            .field("counted", &self.counted)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl AccessGuard {
    /// Which lock was actually granted.
    pub fn grant(&self) -> Grant {
        self.grant
    }

    /// The handle this grant holds.
    pub fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    /// Releases the grant with an explicit resource policy.
    ///
    /// The discard request is sticky: if other users still hold the
    /// handle, the policy is applied by whichever release observes the
    /// in-use count reach zero.
    pub fn release_with(mut self, action: ReleaseAction) {
        self.release_inner(action);
    }

    fn release_inner(&mut self, action: ReleaseAction) {
        if self.released {
            return;
        }
        self.released = true;
        match action {
            ReleaseAction::Retain => {}
            ReleaseAction::Discard => {
                self.handle.state().discard = true;
            }
            ReleaseAction::DiscardKill => {
                let mut st = self.handle.state();
                st.discard = true;
                st.discard_kill = true;
            }
        }
        match self.grant {
            Grant::Shared => self.release_shared(),
            Grant::Exclusive => self.release_exclusive(),
        }
    }

    fn release_shared(&mut self) {
        if self.lock_only {
            let mut st = self.handle.state();
            st.lock_only_holds = st.lock_only_holds.saturating_sub(1);
        }
        drop(self.read_guard.take());
        let remaining = if self.counted {
            self.handle.decr_in_use(self.shared.now_ms())
        } else {
            self.handle.in_use()
        };
        if remaining == 0 {
            self.apply_pending_discard();
        }
    }

    fn release_exclusive(&mut self) {
        let write_guard;
        let fully_released;
        {
            let mut st = self.handle.state();
            debug_assert_eq!(
                st.excl_owner,
                Some(self.owner),
                "exclusive release by a non-owner"
            );
            debug_assert!(st.excl_depth > 0);
            st.excl_depth -= 1;
            if self.lock_only {
                st.lock_only_holds = st.lock_only_holds.saturating_sub(1);
            }
            fully_released = st.excl_depth == 0;
            write_guard = if fully_released {
                st.excl_owner = None;
                st.excl_guard.take()
            } else {
                None
            };
        }
        if self.counted {
            self.handle.decr_in_use(self.shared.now_ms());
        }
        if fully_released {
            // Apply the discard policy while the write lock is still
            // held, then let it go.
            let (discard, kill) = {
                let st = self.handle.state();
                (st.discard, st.discard_kill)
            };
            if discard && self.handle.in_use() == 0 {
                let _ = self.shared.discard_object_locked(&self.handle, kill);
            }
            drop(write_guard);
        }
    }

    fn apply_pending_discard(&self) {
        let (discard, kill) = {
            let st = self.handle.state();
            (st.discard, st.discard_kill)
        };
        if discard && self.handle.in_use() == 0 {
            let _ = self.shared.discard_object(&self.handle, kill);
        }
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.release_inner(ReleaseAction::Retain);
    }
}
