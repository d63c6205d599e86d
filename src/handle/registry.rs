//! Process-wide handle registry: lookup, creation, safe iteration,
//! reclamation, and the idle sweep.
//!
//! One registry exists per engine instance; there is no hidden global.
//! Both index structures (insertion-ordered map and name-hash buckets)
//! live behind a single handle-list mutex that is held for every mutation
//! and every iteration step, and never across a call into the data
//! source.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Bound, Deref};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};
use xxhash_rust::xxh64::xxh64;

use crate::error::{Result, TarnError};
use crate::handle::context::SessionContext;
use crate::handle::handle::{Handle, HandleConfig, HandlePhase};
use crate::source::DataSource;

/// Tuning knobs for the registry.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// How long an open handle must sit unused before
    /// [`sweep`](HandleRegistry::sweep) closes its resource.
    pub sweep_idle: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            sweep_idle: Duration::from_secs(30),
        }
    }
}

/// How a name should be resolved.
#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Construct the handle if no live one matches.
    pub create: bool,
    /// Skip opening the underlying resource; used by lock-only callers
    /// that need the handle without its object.
    pub defer_open: bool,
    /// Configuration installed on a newly constructed handle.
    pub config: HandleConfig,
}

impl ResolveOptions {
    /// Resolve an existing handle only.
    pub fn existing() -> Self {
        Self::default()
    }

    /// Create the handle when missing.
    pub fn create() -> Self {
        ResolveOptions {
            create: true,
            ..Self::default()
        }
    }

    /// Leave the resource unopened.
    pub fn defer_open(mut self) -> Self {
        self.defer_open = true;
        self
    }

    /// Configuration for a newly created handle.
    pub fn with_config(mut self, config: HandleConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Default)]
struct RegistryIndex {
    by_order: BTreeMap<u64, Arc<Handle>>,
    by_hash: FxHashMap<u64, SmallVec<[Arc<Handle>; 2]>>,
}

pub(crate) struct RegistryShared {
    index: Mutex<RegistryIndex>,
    source: Arc<dyn DataSource>,
    config: RegistryConfig,
    start: Instant,
    next_order: AtomicU64,
}

/// The collection of all handles known to an engine instance.
#[derive(Clone)]
pub struct HandleRegistry {
    shared: Arc<RegistryShared>,
}

impl HandleRegistry {
    /// Creates an empty registry over the given data source.
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self::with_config(source, RegistryConfig::default())
    }

    /// Creates an empty registry with explicit tuning.
    pub fn with_config(source: Arc<dyn DataSource>, config: RegistryConfig) -> Self {
        HandleRegistry {
            shared: Arc::new(RegistryShared {
                index: Mutex::new(RegistryIndex::default()),
                source,
                config,
                start: Instant::now(),
                next_order: AtomicU64::new(1),
            }),
        }
    }

    /// Resolves a name (and optional checkpoint) to a referenced handle.
    ///
    /// Lookup and creation happen under the handle-list lock so racing
    /// threads cannot construct duplicates; the slower open of the
    /// underlying resource happens after the lock is released.
    pub fn resolve(
        &self,
        session: &SessionContext,
        name: &str,
        checkpoint: Option<&str>,
        opts: ResolveOptions,
    ) -> Result<HandleRef> {
        let hash = xxh64(name.as_bytes(), 0);
        let href = {
            let mut idx = self.shared.index.lock();
            let mut hit = None;
            if let Some(bucket) = idx.by_hash.get(&hash) {
                for h in bucket {
                    if h.name() == name
                        && h.checkpoint() == checkpoint
                        && !h.is_dead()
                        && !h.is_dropped()
                    {
                        hit = Some(Arc::clone(h));
                        break;
                    }
                }
            }
            match hit {
                Some(h) => {
                    if h.is_inactive() && !opts.create {
                        trace!(name, "registry.resolve.inactive");
                        return Err(TarnError::NotFound);
                    }
                    h.acquire_ref();
                    trace!(name, "registry.resolve.hit");
                    HandleRef::new(h, Arc::clone(&self.shared))
                }
                None => {
                    if !opts.create {
                        trace!(name, "registry.resolve.miss");
                        return Err(TarnError::NotFound);
                    }
                    let order = self.shared.next_order.fetch_add(1, Ordering::Relaxed);
                    let handle = Arc::new(Handle::new(
                        name.to_string(),
                        hash,
                        checkpoint.map(str::to_string),
                        opts.config.clone(),
                        order,
                        self.shared.now_ms(),
                    ));
                    idx.by_order.insert(order, Arc::clone(&handle));
                    idx.by_hash.entry(hash).or_default().push(Arc::clone(&handle));
                    handle.acquire_ref();
                    trace!(name, "registry.resolve.create");
                    HandleRef::new(handle, Arc::clone(&self.shared))
                }
            }
        };
        if !opts.defer_open && !href.is_open() {
            self.shared.ensure_open(session, href.handle())?;
        }
        Ok(href)
    }

    /// Starts a safe full enumeration.
    pub fn cursor(&self) -> HandleCursor {
        HandleCursor {
            shared: Arc::clone(&self.shared),
            pos: 0,
            current: None,
        }
    }

    /// Visits every handle; the closure returns `false` to stop early.
    pub fn walk(&self, mut f: impl FnMut(&HandleRef) -> bool) {
        let mut cursor = self.cursor();
        while let Some(h) = cursor.next() {
            if !f(h) {
                break;
            }
        }
    }

    /// Unlinks and destroys a handle nothing references any more.
    ///
    /// Returns `false` (without touching the handle) when references
    /// remain or the handle was already removed.
    pub fn remove_if_unreferenced(&self, handle: &Arc<Handle>) -> bool {
        if handle.refs() != 0 {
            return false;
        }
        self.shared.reclaim(handle)
    }

    /// Closes the resources of open handles idle longer than the
    /// configured threshold. Dead and dropped handles the sweep visits
    /// are reclaimed by the cursor's own reference releases. Returns the
    /// number of resources closed.
    pub fn sweep(&self, session: &SessionContext) -> usize {
        let cutoff = self
            .shared
            .now_ms()
            .saturating_sub(self.shared.config.sweep_idle.as_millis() as u64);
        let mut closed = 0;
        let mut cursor = self.cursor();
        while let Some(h) = cursor.next() {
            if h.is_open()
                && h.in_use() == 0
                && h.idle_since() <= cutoff
                && matches!(self.shared.discard_object(h.handle(), false), Ok(true))
            {
                h.stats().record_forced_close(session.id());
                closed += 1;
            }
        }
        debug!(closed, "registry.sweep");
        closed
    }

    /// Number of handles currently in the registry, dead ones included.
    pub fn len(&self) -> usize {
        self.shared.index.lock().by_order.len()
    }

    /// True when no handles are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryShared {
    /// Milliseconds since the registry was created.
    pub(crate) fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Opens the resource if it is not open yet. A losing racer waits on
    /// the handle lock for the winner and re-checks; if the lock holder
    /// was not an opener the attempt fails busy.
    pub(crate) fn ensure_open(&self, session: &SessionContext, handle: &Arc<Handle>) -> Result<()> {
        if handle.is_open() {
            return Ok(());
        }
        if let Some(guard) = handle.access().try_write_arc() {
            let res = self.open_object(session, handle);
            drop(guard);
            return res;
        }
        let wait = handle.access().read_arc();
        let open = handle.is_open();
        drop(wait);
        if open {
            Ok(())
        } else {
            Err(TarnError::Busy)
        }
    }

    /// Opens the underlying object. The caller holds the handle's write
    /// lock; the state mutex is never held across the source call.
    pub(crate) fn open_object(&self, session: &SessionContext, handle: &Arc<Handle>) -> Result<()> {
        {
            let st = handle.state();
            match st.phase {
                HandlePhase::Open => return Ok(()),
                HandlePhase::Dead => return Err(TarnError::InvalidState("handle is dead")),
                HandlePhase::Closed => {
                    if st.dropped {
                        return Err(TarnError::InvalidState("handle is dropped"));
                    }
                }
            }
        }
        let object = self.source.open(
            handle.name(),
            handle.checkpoint(),
            handle.kind(),
            handle.config(),
        )?;
        let reopen;
        {
            let mut st = handle.state();
            reopen = st.opened_once;
            st.opened_once = true;
            st.object = Some(object);
            st.phase = HandlePhase::Open;
            st.discard = false;
            st.discard_kill = false;
        }
        handle.stats().record_open(session.id(), reopen);
        trace!(name = %handle.name(), reopen, "registry.open");
        Ok(())
    }

    /// Best-effort teardown of the open resource. Skipped when any other
    /// thread holds the handle lock or the handle is in use.
    pub(crate) fn discard_object(&self, handle: &Arc<Handle>, kill: bool) -> Result<bool> {
        let guard = match handle.access().try_write_arc() {
            Some(g) => g,
            None => return Ok(false),
        };
        let res = self.discard_object_locked(handle, kill);
        drop(guard);
        res.map(|()| true)
    }

    /// Teardown variant for callers already holding the handle's write
    /// lock. The close lock serializes the state flip against registry
    /// iteration and is released before the source call.
    pub(crate) fn discard_object_locked(&self, handle: &Arc<Handle>, kill: bool) -> Result<()> {
        if handle.in_use() > 0 {
            return Ok(());
        }
        let object = {
            let _close = handle.close_lock().lock();
            let mut st = handle.state();
            st.phase = if kill || st.dropped {
                HandlePhase::Dead
            } else {
                HandlePhase::Closed
            };
            st.discard = false;
            st.discard_kill = false;
            st.object.take()
        };
        trace!(name = %handle.name(), kill, "handle.discard");
        if let Some(obj) = object {
            self.source.close(obj)?;
        }
        Ok(())
    }

    /// Drops one reference; the last reference of a dead or dropped
    /// handle triggers removal.
    pub(crate) fn release_handle(&self, handle: &Arc<Handle>) {
        let remaining = handle.release_ref();
        if remaining == 0 && (handle.is_dead() || handle.is_dropped()) {
            self.reclaim(handle);
        }
    }

    /// Unlinks the handle from both index structures and tears down its
    /// resources. The reference count is re-checked under the list lock:
    /// a cursor pinning the handle concurrently wins, and its own release
    /// retries the removal.
    fn reclaim(&self, handle: &Arc<Handle>) -> bool {
        let object = {
            let mut idx = self.index.lock();
            if handle.refs() != 0 {
                return false;
            }
            let _close = handle.close_lock().lock();
            if idx.by_order.remove(&handle.order()).is_none() {
                return false;
            }
            if let Some(bucket) = idx.by_hash.get_mut(&handle.name_hash()) {
                bucket.retain(|h| !Arc::ptr_eq(h, handle));
                if bucket.is_empty() {
                    idx.by_hash.remove(&handle.name_hash());
                }
            }
            let mut st = handle.state();
            st.phase = HandlePhase::Dead;
            st.object.take()
        };
        if let Some(obj) = object {
            let _ = self.source.close(obj);
        }
        debug!(name = %handle.name(), "registry.remove");
        true
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("handles", &self.len())
            .finish()
    }
}

/// A counted reference that keeps a handle's struct alive.
///
/// Dropping the reference releases it; the last release of a dead or
/// dropped handle removes it from the registry.
pub struct HandleRef {
    handle: Arc<Handle>,
    shared: Arc<RegistryShared>,
}

impl HandleRef {
    pub(crate) fn new(handle: Arc<Handle>, shared: Arc<RegistryShared>) -> Self {
        HandleRef { handle, shared }
    }

    /// The underlying handle.
    pub fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    /// Marks the object as logically removed. Lookups fail the handle as
    /// a dead end from here on; the struct persists until in-flight
    /// references drain.
    pub fn mark_dropped(&self) {
        self.handle.mark_dropped();
    }

    pub(crate) fn shared(&self) -> &Arc<RegistryShared> {
        &self.shared
    }
}

impl Deref for HandleRef {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Clone for HandleRef {
    fn clone(&self) -> Self {
        self.handle.acquire_ref();
        HandleRef {
            handle: Arc::clone(&self.handle),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.shared.release_handle(&self.handle);
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.handle, f)
    }
}

/// Step-wise registry enumeration that never lets its current handle be
/// destroyed underneath it.
///
/// Every advance takes the handle-list lock, acquires the reference on
/// the successor, and only then releases the reference on the previous
/// handle. Dropping the cursor mid-walk releases the last reference.
pub struct HandleCursor {
    shared: Arc<RegistryShared>,
    pos: u64,
    current: Option<HandleRef>,
}

impl HandleCursor {
    /// Advances to the next handle in insertion order.
    pub fn next(&mut self) -> Option<&HandleRef> {
        let next = {
            let idx = self.shared.index.lock();
            idx.by_order
                .range((Bound::Excluded(self.pos), Bound::Unbounded))
                .next()
                .map(|(&order, h)| {
                    h.acquire_ref();
                    (order, HandleRef::new(Arc::clone(h), Arc::clone(&self.shared)))
                })
        };
        match next {
            Some((order, href)) => {
                self.pos = order;
                // The previous reference is released here, after the
                // successor is pinned.
                self.current = Some(href);
                self.current.as_ref()
            }
            None => {
                self.current = None;
                None
            }
        }
    }
}
