//! The handle entity: identity, state machine, counters, and locks.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockWriteGuard, Mutex, MutexGuard, RawRwLock, RwLock};
use smallvec::SmallVec;
use tracing::trace;

use crate::handle::context::SessionId;
use crate::source::DataObject;

/// URI of the engine's own metadata object.
pub const METADATA_URI: &str = "file:tarn.meta";

/// Number of statistics slots per handle. Sessions are striped across
/// slots to keep counter updates from sharing a cache line.
const STAT_SLOTS: usize = 8;

/// Kind of object a handle addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandleKind {
    /// A raw tree object (`file:` URIs).
    Btree,
    /// A table built on one or more trees (`table:` URIs).
    Table,
}

impl HandleKind {
    /// Derives the kind from a URI prefix.
    pub fn from_uri(name: &str) -> Self {
        if name.starts_with("table:") {
            HandleKind::Table
        } else {
            HandleKind::Btree
        }
    }
}

/// Layered configuration carried by a handle.
///
/// `layers` is ordered outermost to innermost; `meta_base` is the base
/// metadata string the layers refine.
#[derive(Clone, Debug, Default)]
pub struct HandleConfig {
    /// Configuration strings, outermost first.
    pub layers: SmallVec<[String; 4]>,
    /// Base metadata configuration.
    pub meta_base: String,
}

/// Lifecycle phase of a handle.
///
/// Orthogonal attributes (dropped, metadata, lock-only, discard policy)
/// live next to the phase rather than inside it; composite states are
/// derived by [`Handle::is_inactive`] and [`Handle::can_reopen`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandlePhase {
    /// No live resource; the struct may be retained for cheap reopen.
    Closed,
    /// The underlying resource is live and usable.
    Open,
    /// Awaiting discard; unreachable by lookup, existing references may
    /// still drain.
    Dead,
}

/// Bit values of the legacy flag encoding, exposed for compatibility.
///
/// Internally the handle tracks an explicit phase plus booleans;
/// [`Handle::flag_bits`] projects that state onto these bits.
pub mod flags {
    /// Dead, awaiting discard.
    pub const DEAD: u32 = 0x01;
    /// Close the underlying resource on release.
    pub const DISCARD: u32 = 0x02;
    /// Mark dead on release instead of a plain close.
    pub const DISCARD_KILL: u32 = 0x04;
    /// Object logically removed.
    pub const DROPPED: u32 = 0x08;
    /// Exclusive access currently held.
    pub const EXCLUSIVE: u32 = 0x10;
    /// Handle addresses the engine's own metadata object.
    pub const IS_METADATA: u32 = 0x20;
    /// Caller needs only the lock, not an open resource.
    pub const LOCK_ONLY: u32 = 0x40;
    /// Underlying resource is open.
    pub const OPEN: u32 = 0x80;
}

pub(crate) struct HandleState {
    pub(crate) phase: HandlePhase,
    pub(crate) dropped: bool,
    pub(crate) metadata: bool,
    pub(crate) lock_only_holds: u32,
    pub(crate) discard: bool,
    pub(crate) discard_kill: bool,
    pub(crate) opened_once: bool,
    pub(crate) excl_owner: Option<SessionId>,
    pub(crate) excl_depth: u32,
    pub(crate) excl_guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
    pub(crate) object: Option<Box<dyn DataObject>>,
}

/// One open named data source.
///
/// The struct is kept alive by [`refs`](Handle::refs); the resource it
/// wraps is kept alive by [`in_use`](Handle::in_use). The two are
/// independent dimensions: a reference pins the struct, shared/exclusive
/// access governs current usage of the resource.
pub struct Handle {
    name: String,
    name_hash: u64,
    checkpoint: Option<String>,
    kind: HandleKind,
    config: HandleConfig,
    order: u64,

    refs: AtomicU32,
    in_use: AtomicI32,
    idle_since: AtomicU64,

    access: Arc<RwLock<()>>,
    close_lock: Mutex<()>,
    state: Mutex<HandleState>,
    stats: HandleStats,
}

impl Handle {
    pub(crate) fn new(
        name: String,
        name_hash: u64,
        checkpoint: Option<String>,
        config: HandleConfig,
        order: u64,
        now_ms: u64,
    ) -> Self {
        let kind = HandleKind::from_uri(&name);
        let metadata = name == METADATA_URI;
        Handle {
            name,
            name_hash,
            checkpoint,
            kind,
            config,
            order,
            refs: AtomicU32::new(0),
            in_use: AtomicI32::new(0),
            idle_since: AtomicU64::new(now_ms),
            access: Arc::new(RwLock::new(())),
            close_lock: Mutex::new(()),
            state: Mutex::new(HandleState {
                phase: HandlePhase::Closed,
                dropped: false,
                metadata,
                lock_only_holds: 0,
                discard: false,
                discard_kill: false,
                opened_once: false,
                excl_owner: None,
                excl_depth: 0,
                excl_guard: None,
                object: None,
            }),
            stats: HandleStats::default(),
        }
    }

    /// Object name as a URI.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Precomputed hash of the name.
    pub fn name_hash(&self) -> u64 {
        self.name_hash
    }

    /// Checkpoint name, when the handle addresses a specific checkpoint
    /// rather than the live object.
    pub fn checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    /// Kind of the underlying object.
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Layered configuration.
    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// Current reference count (threads keeping the struct alive).
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Current in-use count (threads actively operating through the
    /// handle right now).
    pub fn in_use(&self) -> i32 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Milliseconds (since registry start) at which the in-use count last
    /// reached zero. Consumed by the idle sweep.
    pub fn idle_since(&self) -> u64 {
        self.idle_since.load(Ordering::Acquire)
    }

    /// True while the underlying resource is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().phase == HandlePhase::Open
    }

    /// True once the handle is awaiting discard.
    pub fn is_dead(&self) -> bool {
        self.state.lock().phase == HandlePhase::Dead
    }

    /// True once the object has been logically removed.
    pub fn is_dropped(&self) -> bool {
        self.state.lock().dropped
    }

    /// True for the engine's own metadata handle.
    pub fn is_metadata(&self) -> bool {
        self.state.lock().metadata
    }

    /// Session currently holding exclusive access, if any.
    pub fn exclusive_owner(&self) -> Option<SessionId> {
        self.state.lock().excl_owner
    }

    /// An inactive handle holds no live resource and must not be used
    /// for I/O: it is dead, or neither open nor exclusively held.
    pub fn is_inactive(&self) -> bool {
        let st = self.state.lock();
        st.phase == HandlePhase::Dead
            || (st.phase != HandlePhase::Open && st.excl_owner.is_none())
    }

    /// A lookup miss on a cached handle can be satisfied by reopening
    /// only if the handle is active, open, and not dropped.
    pub fn can_reopen(&self) -> bool {
        let st = self.state.lock();
        let inactive = st.phase == HandlePhase::Dead
            || (st.phase != HandlePhase::Open && st.excl_owner.is_none());
        !inactive && st.phase == HandlePhase::Open && !st.dropped
    }

    /// Projects the current state onto the legacy [`flags`] encoding.
    pub fn flag_bits(&self) -> u32 {
        let st = self.state.lock();
        let mut bits = 0;
        match st.phase {
            HandlePhase::Dead => bits |= flags::DEAD,
            HandlePhase::Open => bits |= flags::OPEN,
            HandlePhase::Closed => {}
        }
        if st.discard {
            bits |= flags::DISCARD;
        }
        if st.discard_kill {
            bits |= flags::DISCARD_KILL;
        }
        if st.dropped {
            bits |= flags::DROPPED;
        }
        if st.excl_owner.is_some() {
            bits |= flags::EXCLUSIVE;
        }
        if st.metadata {
            bits |= flags::IS_METADATA;
        }
        if st.lock_only_holds > 0 {
            bits |= flags::LOCK_ONLY;
        }
        bits
    }

    /// Aggregated statistics across all slots.
    pub fn stats_snapshot(&self) -> HandleStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn order(&self) -> u64 {
        self.order
    }

    pub(crate) fn access(&self) -> &Arc<RwLock<()>> {
        &self.access
    }

    pub(crate) fn close_lock(&self) -> &Mutex<()> {
        &self.close_lock
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }

    pub(crate) fn stats(&self) -> &HandleStats {
        &self.stats
    }

    pub(crate) fn acquire_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining count.
    pub(crate) fn release_ref(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "handle reference released without a matching acquire");
        prev - 1
    }

    pub(crate) fn incr_in_use(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining count, stamping the idle time on the last
    /// decrement.
    pub(crate) fn decr_in_use(&self, now_ms: u64) -> i32 {
        let prev = self.in_use.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "handle in-use released without a matching acquire");
        if prev == 1 {
            self.idle_since.store(now_ms, Ordering::Release);
        }
        prev - 1
    }

    pub(crate) fn mark_dropped(&self) {
        let mut st = self.state.lock();
        if !st.dropped {
            st.dropped = true;
            trace!(name = %self.name, "handle.dropped");
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("checkpoint", &self.checkpoint)
            .field("kind", &self.kind)
            .field("phase", &st.phase)
            .field("dropped", &st.dropped)
            .field("refs", &self.refs())
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[derive(Default)]
struct StatSlot {
    opens: AtomicU64,
    reopens: AtomicU64,
    shared_grants: AtomicU64,
    excl_grants: AtomicU64,
    busy_rejections: AtomicU64,
    forced_closes: AtomicU64,
}

/// Per-handle counters, striped across slots by session id.
#[derive(Default)]
pub struct HandleStats {
    slots: [StatSlot; STAT_SLOTS],
}

/// Aggregate view of [`HandleStats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HandleStatsSnapshot {
    /// First-time resource opens.
    pub opens: u64,
    /// Opens of a previously discarded resource.
    pub reopens: u64,
    /// Shared grants handed out.
    pub shared_grants: u64,
    /// Exclusive grants handed out (including reentrant ones).
    pub excl_grants: u64,
    /// Exclusive attempts rejected busy.
    pub busy_rejections: u64,
    /// Resource teardowns forced by discard or sweep.
    pub forced_closes: u64,
}

impl HandleStats {
    fn slot(&self, session: SessionId) -> &StatSlot {
        &self.slots[session.0 as usize & (STAT_SLOTS - 1)]
    }

    pub(crate) fn record_open(&self, session: SessionId, reopen: bool) {
        let slot = self.slot(session);
        if reopen {
            slot.reopens.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.opens.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_shared(&self, session: SessionId) {
        self.slot(session).shared_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exclusive(&self, session: SessionId) {
        self.slot(session).excl_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_busy(&self, session: SessionId) {
        self.slot(session)
            .busy_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forced_close(&self, session: SessionId) {
        self.slot(session)
            .forced_closes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> HandleStatsSnapshot {
        let mut out = HandleStatsSnapshot::default();
        for slot in &self.slots {
            out.opens += slot.opens.load(Ordering::Relaxed);
            out.reopens += slot.reopens.load(Ordering::Relaxed);
            out.shared_grants += slot.shared_grants.load(Ordering::Relaxed);
            out.excl_grants += slot.excl_grants.load(Ordering::Relaxed);
            out.busy_rejections += slot.busy_rejections.load(Ordering::Relaxed);
            out.forced_closes += slot.forced_closes.load(Ordering::Relaxed);
        }
        out
    }
}
