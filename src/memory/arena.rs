//! Arena pool manager
//!
//! A fixed set of native arenas is created up front. A thread that asks for
//! memory is bound to one free arena, and every allocation it makes through
//! the pool is tagged with that arena. Bindings are cached per thread, so
//! once a thread is bound the allocation path takes no lock at all.
//!
//! Two locks guard shared state and are never held together:
//! - the pool lock (arena membership and the free set)
//! - the binding lock (thread -> arena map)
//!
//! A binding ends when the thread calls [`ArenaAllocator::release_arena`]
//! or when the thread exits; either way the arena goes back to the free set.
//!
//! The owning thread may reset or destroy its arena, so nothing the pool
//! keeps for itself lives in one: shared state is built on the default
//! arena with fixed capacity, and the per-thread cache is inline
//! thread-local storage.

use crate::core::config::ArenaConfig;
use crate::core::error::{Error, Result};
use crate::memory::ctl;
use crate::memory::ehooks::{ExtentHookStats, ExtentHookTable};
use crate::system::metrics;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_uint, c_void};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pool bindings one thread can hold at the same time
pub const LOCAL_BINDING_SLOTS: usize = 16;

const EMPTY_SLOT: Option<LocalBinding> = None;

thread_local! {
    static LOCAL_BINDINGS: RefCell<[Option<LocalBinding>; LOCAL_BINDING_SLOTS]> =
        const { RefCell::new([EMPTY_SLOT; LOCAL_BINDING_SLOTS]) };
}

/// Per-thread cache entry for one pool binding.
///
/// Dropping it (explicit release or thread exit) returns the arena.
struct LocalBinding {
    pool_id: u64,
    arena: u32,
    previous: Option<c_uint>,
    thread: ThreadId,
    pool: Weak<PoolInner>,
}

impl Drop for LocalBinding {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.return_arena(self.thread, self.arena);
        }
    }
}

fn cached_arena(pool_id: u64) -> Option<u32> {
    LOCAL_BINDINGS
        .try_with(|bindings| {
            bindings.try_borrow().ok().and_then(|b| {
                b.iter()
                    .flatten()
                    .find(|l| l.pool_id == pool_id)
                    .map(|l| l.arena)
            })
        })
        .ok()
        .flatten()
}

// Entries are moved out before they are dropped so Drop never runs under the borrow.
fn take_cached_where(matches: impl Fn(&LocalBinding) -> bool) -> Option<LocalBinding> {
    LOCAL_BINDINGS
        .try_with(|bindings| {
            let mut bindings = bindings.try_borrow_mut().ok()?;
            bindings
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(&matches))?
                .take()
        })
        .ok()
        .flatten()
}

fn take_cached(pool_id: u64) -> Option<LocalBinding> {
    take_cached_where(|l| l.pool_id == pool_id)
}

fn has_free_slot() -> bool {
    LOCAL_BINDINGS
        .try_with(|bindings| {
            bindings
                .try_borrow()
                .is_ok_and(|b| b.iter().any(Option::is_none))
        })
        .unwrap_or(false)
}

/// Put `binding` in the first empty slot, or hand it back if there is none.
fn store_binding(binding: LocalBinding) -> std::result::Result<(), LocalBinding> {
    let mut pending = Some(binding);
    // The closure only runs while thread-local storage is alive
    let _ = LOCAL_BINDINGS.try_with(|bindings| {
        if let Ok(mut bindings) = bindings.try_borrow_mut() {
            if let Some(slot) = bindings.iter_mut().find(|slot| slot.is_none()) {
                *slot = pending.take();
            }
        }
    });
    match pending {
        None => Ok(()),
        Some(binding) => Err(binding),
    }
}

/// Drop cached bindings whose pool is gone, unpinning the thread from their arena.
fn prune_dead_bindings() {
    while let Some(dead) = take_cached_where(|l| l.pool.strong_count() == 0) {
        match unsafe { ctl::read::<c_uint>(ctl::THREAD_ARENA) } {
            Ok(current) if current == dead.arena => restore_thread_arena(&dead),
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read arena of thread {:?}: {}", dead.thread, e);
                metrics::record(|m| m.native_failures.inc());
            }
        }
        debug!("Dropped binding to arena {} of a torn-down pool", dead.arena);
    }
}

/// Run `f` with the calling thread's untagged allocations sent to the default arena.
fn on_default_arena<R>(f: impl FnOnce() -> R) -> R {
    let switched = unsafe {
        ctl::exchange::<c_uint, c_uint>(ctl::THREAD_ARENA, Some(ctl::DEFAULT_ARENA))
    };
    if let Err(e) = &switched {
        warn!("Pool bookkeeping stays on the current arena: {}", e);
    }

    let result = f();

    if let Ok(previous) = switched {
        if let Err(e) = unsafe { ctl::exchange::<c_uint, c_uint>(ctl::THREAD_ARENA, Some(previous)) } {
            error!("Failed to restore arena {}: {}", previous, e);
            metrics::record(|m| m.native_failures.inc());
        }
    }
    result
}

fn restore_thread_arena(binding: &LocalBinding) {
    if let Some(previous) = binding.previous {
        if let Err(e) = unsafe { ctl::exchange::<c_uint, c_uint>(ctl::THREAD_ARENA, Some(previous)) } {
            error!("Failed to restore arena {} for thread {:?}: {}", previous, binding.thread, e);
            metrics::record(|m| m.native_failures.inc());
        }
    }
}

fn flush_thread_cache() {
    if let Err(e) = ctl::execute(ctl::THREAD_TCACHE_FLUSH) {
        debug!("Thread cache flush skipped: {}", e);
    }
}

/// Pool membership, guarded by the pool lock.
///
/// Both collections are sized for the full pool up front and never grow.
struct PoolState {
    all: Vec<u32>,
    free: VecDeque<u32>,
}

struct PoolInner {
    id: u64,
    capacity: usize,
    pool: Mutex<PoolState>,
    bindings: Mutex<HashMap<ThreadId, u32>>,
    // Declared last: arenas referencing it are destroyed in Drop first.
    hooks: Option<ExtentHookTable>,
}

impl PoolInner {
    fn create_arena(&self) -> Result<u32> {
        let arena: c_uint = match &self.hooks {
            Some(hooks) => unsafe { ctl::exchange(ctl::ARENAS_CREATE, Some(hooks.as_raw())) }?,
            None => unsafe { ctl::read(ctl::ARENAS_CREATE) }?,
        };
        Ok(arena)
    }

    fn preallocate(&self) {
        let mut created = Vec::with_capacity(self.capacity);
        for _ in 0..self.capacity {
            match self.create_arena() {
                Ok(arena) => {
                    info!("Arena {} created", arena);
                    metrics::record(|m| m.arenas_created.inc());
                    created.push(arena);
                }
                Err(e) => {
                    error!("Failed to create arena: {}", e);
                    metrics::record(|m| m.native_failures.inc());
                }
            }
        }

        let mut pool = self.pool.lock();
        pool.free.extend(created.iter().copied());
        pool.all.extend(created);
    }

    fn return_arena(&self, thread: ThreadId, arena: u32) {
        {
            let mut pool = self.pool.lock();
            if pool.all.contains(&arena) && !pool.free.contains(&arena) {
                pool.free.push_back(arena);
            }
        }
        {
            let mut bindings = self.bindings.lock();
            if bindings.get(&thread) == Some(&arena) {
                bindings.remove(&thread);
            }
        }
        debug!("Arena {} returned by thread {:?}", arena, thread);
    }

    fn owner_of(&self, arena: u32) -> Option<ThreadId> {
        self.bindings
            .lock()
            .iter()
            .find(|(_, &bound)| bound == arena)
            .map(|(thread, _)| *thread)
    }

    /// Take `arena` out of the free set; false if it is not free.
    fn claim_free(&self, arena: u32) -> bool {
        let mut pool = self.pool.lock();
        match pool.free.iter().position(|&free| free == arena) {
            Some(pos) => {
                pool.free.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Swap a destroyed arena for a fresh one so the pool keeps its size.
    ///
    /// The native allocator recycles destroyed indices for later creations,
    /// possibly by other pools, so the old id cannot simply be reused.
    fn replace_destroyed(&self, arena: u32) {
        let replacement = self.create_arena();

        let mut pool = self.pool.lock();
        pool.all.retain(|&a| a != arena);
        match replacement {
            Ok(fresh) => {
                pool.all.push(fresh);
                pool.free.push_back(fresh);
                drop(pool);
                info!("Arena {} created to replace arena {}", fresh, arena);
                metrics::record(|m| m.arenas_created.inc());
            }
            Err(e) => {
                drop(pool);
                error!("Failed to replace destroyed arena {}: {}", arena, e);
                metrics::record(|m| m.native_failures.inc());
            }
        }
    }

    fn ensure_known(&self, arena: u32) -> Result<()> {
        if self.pool.lock().all.contains(&arena) {
            Ok(())
        } else {
            error!("Arena {} does not belong to this pool", arena);
            Err(Error::UnknownArena(arena))
        }
    }

    /// Destroy every free arena; destroyed ids leave the pool.
    fn destroy_free_arenas(&self) -> usize {
        // Taken out of the free set so nobody binds them mid-destroy
        let candidates: Vec<u32> = self.pool.lock().free.drain(..).collect();
        flush_thread_cache();

        let mut destroyed = Vec::with_capacity(candidates.len());
        let mut survivors = Vec::new();
        for arena in candidates {
            match ctl::execute_for_arena(ctl::ARENA_DESTROY, arena) {
                Ok(()) => destroyed.push(arena),
                Err(e) => {
                    error!("Failed to destroy arena {}: {}", arena, e);
                    metrics::record(|m| m.native_failures.inc());
                    survivors.push(arena);
                }
            }
        }

        {
            let mut pool = self.pool.lock();
            pool.all.retain(|arena| !destroyed.contains(arena));
            pool.free.extend(survivors);
        }
        info!("Arenas destroyed: {}", destroyed.len());
        destroyed.len()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // The dropping thread may still hold a binding; its guard can no
        // longer reach us, so undo it here.
        if let Some(binding) = take_cached(self.id) {
            restore_thread_arena(&binding);
            self.return_arena(binding.thread, binding.arena);
        }

        self.destroy_free_arenas();

        let remaining = self.pool.get_mut().all.len();
        if remaining > 0 {
            if let Some(hooks) = self.hooks.take() {
                warn!("{} arenas still alive at pool teardown; extent hooks stay mapped", remaining);
                std::mem::forget(hooks);
            }
        }
    }
}

/// Snapshot of pool membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Arenas requested at construction
    pub capacity: usize,
    /// Arenas that were actually created and not torn down
    pub created: usize,
    /// Arena ids available for binding
    pub free: Vec<u32>,
    /// Arena ids currently bound to a thread
    pub bound: Vec<u32>,
}

/// Per-thread arena pool over the native allocator.
///
/// Cloning yields another handle to the same pool. The pool is torn down
/// when the last handle (and the last thread binding) goes away.
#[derive(Clone)]
pub struct ArenaAllocator {
    inner: Arc<PoolInner>,
}

impl ArenaAllocator {
    /// Pool sized to the host's hardware concurrency, with extent hooks
    pub fn new() -> Self {
        Self::from_config(&ArenaConfig::default())
    }

    /// Pool with an explicit number of arenas (0 = hardware concurrency)
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self::from_config(&ArenaConfig {
            pool_size,
            ..Default::default()
        })
    }

    /// Build a pool from configuration.
    ///
    /// Arenas that fail to create are logged and skipped; the pool runs
    /// with reduced capacity rather than failing.
    pub fn from_config(config: &ArenaConfig) -> Self {
        let inner = on_default_arena(|| {
            // Counters are created lazily; make sure that happens here
            metrics::record(|_| {});

            let hooks = if config.extent_hooks {
                match ExtentHookTable::new() {
                    Ok(table) => Some(table),
                    Err(e) => {
                        warn!("Extent hooks unavailable, using native defaults: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            let capacity = config.effective_pool_size();
            let inner = PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                capacity,
                pool: Mutex::new(PoolState {
                    all: Vec::with_capacity(capacity),
                    free: VecDeque::with_capacity(capacity),
                }),
                // Headroom so removals never force a reallocating rehash
                bindings: Mutex::new(HashMap::with_capacity(capacity * 2)),
                hooks,
            };
            inner.preallocate();
            Arc::new(inner)
        });

        Self { inner }
    }

    /// Allocate `size` bytes from the calling thread's arena, binding one first if needed.
    #[inline]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let arena = self.bound_arena()?;
        Self::allocate_in(arena, size, None)
    }

    /// Allocate with a power-of-two alignment from the calling thread's arena.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            error!("Rejected allocation with alignment {}", alignment);
            return Err(Error::InvalidAlignment(alignment));
        }
        let arena = self.bound_arena()?;
        Self::allocate_in(arena, size, Some(alignment))
    }

    #[inline]
    fn bound_arena(&self) -> Result<u32> {
        match self.current_arena() {
            Some(arena) => Ok(arena),
            None => self.request_arena(),
        }
    }

    fn allocate_in(arena: u32, size: usize, alignment: Option<usize>) -> Result<NonNull<u8>> {
        NonNull::new(ctl::allocate(size, alignment, arena)).ok_or_else(|| {
            error!("Failed to allocate {} bytes in arena {}", size, arena);
            metrics::record(|m| m.native_failures.inc());
            Error::OutOfMemory { size, arena }
        })
    }

    /// Release memory obtained from [`allocate`](Self::allocate). Null is a no-op.
    ///
    /// The pointer may have been allocated by any thread; `size` may be 0
    /// when unknown.
    ///
    /// # Safety
    /// `ptr` must come from this allocator's `allocate` and not be freed twice.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        unsafe { ctl::deallocate(ptr, size, None) }
    }

    /// Release memory obtained from [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// # Safety
    /// `ptr` must come from `allocate_aligned` with the same `alignment`.
    pub unsafe fn free_aligned(&self, ptr: *mut u8, size: usize, alignment: usize) {
        if ptr.is_null() {
            return;
        }
        unsafe { ctl::deallocate(ptr, size, Some(alignment)) }
    }

    /// Arena index owning `ptr`
    pub fn look_up(&self, ptr: *const u8) -> Result<u32> {
        let ptr: *const c_void = ptr.cast();
        let arena: c_uint = unsafe { ctl::exchange(ctl::ARENAS_LOOKUP, Some(ptr)) }.map_err(|e| {
            error!("Failed to look up arena for {:p}: {}", ptr, e);
            e
        })?;
        Ok(arena)
    }

    /// Cumulative bytes allocated by the calling thread; `None` if unavailable
    pub fn thread_total_allocated_bytes(&self) -> Option<u64> {
        Self::thread_counter(ctl::THREAD_ALLOCATED)
    }

    /// Cumulative bytes deallocated by the calling thread; `None` if unavailable
    pub fn thread_total_deallocated_bytes(&self) -> Option<u64> {
        Self::thread_counter(ctl::THREAD_DEALLOCATED)
    }

    fn thread_counter(name: &'static std::ffi::CStr) -> Option<u64> {
        match unsafe { ctl::read::<u64>(name) } {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to read thread counter: {}", e);
                None
            }
        }
    }

    /// Arena bound to the calling thread, if any. Takes no lock.
    #[inline]
    pub fn current_arena(&self) -> Option<u32> {
        cached_arena(self.inner.id)
    }

    /// Bind the calling thread to a free arena.
    ///
    /// Returns the existing binding if there is one. Fails immediately,
    /// without waiting, when every arena is bound.
    pub fn request_arena(&self) -> Result<u32> {
        if let Some(arena) = self.current_arena() {
            return Ok(arena);
        }
        let thread = thread::current().id();

        prune_dead_bindings();
        if !has_free_slot() {
            error!("Thread {:?} already holds {} pool bindings", thread, LOCAL_BINDING_SLOTS);
            return Err(Error::TooManyBindings {
                limit: LOCAL_BINDING_SLOTS,
            });
        }

        let arena = {
            let mut pool = self.inner.pool.lock();
            match pool.free.pop_front() {
                Some(arena) => arena,
                None => {
                    let pool_size = pool.all.len();
                    drop(pool);
                    error!("All arenas used ({} in pool)", pool_size);
                    metrics::record(|m| m.pool_exhaustions.inc());
                    return Err(Error::PoolExhausted { pool_size });
                }
            }
        };
        info!("Arena {} requested for thread {:?}", arena, thread);

        self.inner.bindings.lock().insert(thread, arena);

        let previous = match unsafe { ctl::exchange::<c_uint, c_uint>(ctl::THREAD_ARENA, Some(arena)) } {
            Ok(previous) => previous,
            Err(e) => {
                error!("Failed to bind arena {} for thread {:?}: {}", arena, thread, e);
                metrics::record(|m| m.native_failures.inc());
                self.inner.return_arena(thread, arena);
                return Err(e);
            }
        };

        let binding = LocalBinding {
            pool_id: self.inner.id,
            arena,
            previous: Some(previous),
            thread,
            pool: Arc::downgrade(&self.inner),
        };
        // No allocation from here on: the thread now allocates from `arena`.
        if let Err(binding) = store_binding(binding) {
            // Thread is tearing down: undo everything.
            restore_thread_arena(&binding);
            drop(binding);
            return Err(Error::native("thread.arena", -1));
        }

        metrics::record(|m| m.bindings.inc());
        Ok(arena)
    }

    /// Return the calling thread's arena to the pool.
    ///
    /// The thread's previous native arena is restored. Returns the released
    /// arena, or `None` if the thread was not bound.
    pub fn release_arena(&self) -> Option<u32> {
        let binding = take_cached(self.inner.id)?;
        let arena = binding.arena;
        restore_thread_arena(&binding);
        drop(binding);

        metrics::record(|m| m.releases.inc());
        Some(arena)
    }

    /// Destroy one arena and return its slot to the free set.
    ///
    /// The arena must have no live allocations. If the caller is bound to
    /// it, the binding is released first; an arena bound to another thread
    /// is refused. The slot is refilled with a freshly created arena, which
    /// usually receives the same index.
    pub fn destroy_arena(&self, arena: u32) -> Result<()> {
        self.inner.ensure_known(arena)?;

        if self.current_arena() == Some(arena) {
            self.release_arena();
        }
        if !self.inner.claim_free(arena) {
            let owner = self.inner.owner_of(arena);
            error!("Refusing to destroy arena {} bound to thread {:?}", arena, owner);
            return Err(Error::ArenaInUse(arena));
        }

        flush_thread_cache();
        if let Err(e) = ctl::execute_for_arena(ctl::ARENA_DESTROY, arena) {
            error!("Failed to destroy arena {}: {}", arena, e);
            metrics::record(|m| m.native_failures.inc());
            self.inner.pool.lock().free.push_back(arena);
            return Err(e);
        }
        info!("Arena {} destroyed", arena);

        self.inner.replace_destroyed(arena);
        Ok(())
    }

    /// Discard every allocation in `arena`, keeping the arena itself.
    pub fn reset_arena(&self, arena: u32) -> Result<()> {
        self.inner.ensure_known(arena)?;

        flush_thread_cache();
        ctl::execute_for_arena(ctl::ARENA_RESET, arena).map_err(|e| {
            error!("Failed to reset arena {}: {}", arena, e);
            metrics::record(|m| m.native_failures.inc());
            e
        })?;
        debug!("Arena {} reset", arena);
        Ok(())
    }

    /// Destroy every free arena. Bound arenas are left alone.
    ///
    /// Destroyed arenas leave the pool for good. Returns how many were destroyed.
    pub fn destroy_all_arenas(&self) -> usize {
        self.inner.destroy_free_arenas()
    }

    /// Reset every free arena. Bound arenas are left alone.
    ///
    /// Returns how many were reset.
    pub fn reset_all_arenas(&self) -> usize {
        let free: Vec<u32> = self.inner.pool.lock().free.iter().copied().collect();
        flush_thread_cache();

        let mut reset = 0;
        for arena in free {
            match ctl::execute_for_arena(ctl::ARENA_RESET, arena) {
                Ok(()) => reset += 1,
                Err(e) => {
                    error!("Failed to reset arena {}: {}", arena, e);
                    metrics::record(|m| m.native_failures.inc());
                }
            }
        }
        info!("Arenas reset: {}", reset);
        reset
    }

    /// Number of arenas currently in the pool
    pub fn pool_size(&self) -> usize {
        self.inner.pool.lock().all.len()
    }

    /// Number of arenas requested at construction
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Membership snapshot. Free and bound sets are read under separate locks.
    pub fn status(&self) -> PoolStatus {
        let (created, mut free) = {
            let pool = self.inner.pool.lock();
            (pool.all.len(), pool.free.iter().copied().collect::<Vec<_>>())
        };
        let mut bound: Vec<u32> = self.inner.bindings.lock().values().copied().collect();
        free.sort_unstable();
        bound.sort_unstable();

        PoolStatus {
            capacity: self.inner.capacity,
            created,
            free,
            bound,
        }
    }

    /// Extent hook activity, or `None` when the pool uses native defaults
    pub fn extent_hook_stats(&self) -> Option<ExtentHookStats> {
        self.inner.hooks.as_ref().map(ExtentHookTable::stats)
    }
}

impl Default for ArenaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("extent_hooks", &self.inner.hooks.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_preallocates_requested_arenas() {
        let pool = ArenaAllocator::with_pool_size(3);
        let status = pool.status();
        assert_eq!(status.capacity, 3);
        assert_eq!(status.created, 3);
        assert_eq!(status.free.len(), 3);
        assert!(status.bound.is_empty());
        assert!(pool.extent_hook_stats().is_some());
    }

    #[test]
    fn test_first_allocation_binds_thread() {
        let pool = ArenaAllocator::with_pool_size(2);
        assert_eq!(pool.current_arena(), None);

        let ptr = pool.allocate(64).unwrap();
        let arena = pool.current_arena().unwrap();
        assert_eq!(pool.look_up(ptr.as_ptr()).unwrap(), arena);

        let status = pool.status();
        assert_eq!(status.bound, vec![arena]);
        assert!(!status.free.contains(&arena));

        unsafe { pool.free(ptr.as_ptr(), 64) };
    }

    #[test]
    fn test_binding_is_stable_across_allocations() {
        let pool = ArenaAllocator::with_pool_size(2);
        let a = pool.allocate(32).unwrap();
        let b = pool.allocate(4096).unwrap();
        assert_eq!(pool.look_up(a.as_ptr()).unwrap(), pool.look_up(b.as_ptr()).unwrap());
        assert_eq!(pool.request_arena().unwrap(), pool.current_arena().unwrap());
        assert_eq!(pool.status().bound.len(), 1);

        unsafe {
            pool.free(a.as_ptr(), 32);
            pool.free(b.as_ptr(), 0);
        }
    }

    #[test]
    fn test_release_returns_arena_to_free_set() {
        let pool = ArenaAllocator::with_pool_size(1);
        let arena = pool.request_arena().unwrap();
        assert_eq!(pool.release_arena(), Some(arena));
        assert_eq!(pool.current_arena(), None);
        assert_eq!(pool.release_arena(), None);

        let status = pool.status();
        assert_eq!(status.free, vec![arena]);
        assert!(status.bound.is_empty());
    }

    #[test]
    fn test_exhausted_pool_fails_without_blocking() {
        let pool = ArenaAllocator::with_pool_size(1);
        let held = pool.request_arena().unwrap();

        let other = pool.clone();
        let result = thread::spawn(move || other.allocate(16).map(|_| ())).join().unwrap();
        assert!(matches!(result, Err(Error::PoolExhausted { pool_size: 1 })));

        // The failed request must not disturb the existing binding
        assert_eq!(pool.status().bound, vec![held]);
    }

    #[test]
    fn test_thread_exit_returns_arena() {
        let pool = ArenaAllocator::with_pool_size(1);
        let worker = pool.clone();
        let arena = thread::spawn(move || {
            let ptr = worker.allocate(128).unwrap();
            unsafe { worker.free(ptr.as_ptr(), 128) };
            worker.current_arena().unwrap()
        })
        .join()
        .unwrap();

        let status = pool.status();
        assert_eq!(status.free, vec![arena]);
        assert!(status.bound.is_empty());
        assert_eq!(pool.request_arena().unwrap(), arena);
    }

    #[test]
    fn test_free_null_is_noop() {
        let pool = ArenaAllocator::with_pool_size(1);
        unsafe { pool.free(std::ptr::null_mut(), 64) };
        assert_eq!(pool.current_arena(), None);
    }

    #[test]
    fn test_zero_sized_allocation() {
        let pool = ArenaAllocator::with_pool_size(1);
        let ptr = pool.allocate(0).unwrap();
        unsafe { pool.free(ptr.as_ptr(), 0) };
    }

    #[test]
    fn test_aligned_allocation() {
        let pool = ArenaAllocator::with_pool_size(1);
        let ptr = pool.allocate_aligned(100, 256).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 256, 0);
        unsafe { pool.free_aligned(ptr.as_ptr(), 100, 256) };

        assert!(matches!(pool.allocate_aligned(8, 24), Err(Error::InvalidAlignment(24))));
    }

    #[test]
    fn test_thread_counters_observe_pool_allocations() {
        let pool = ArenaAllocator::with_pool_size(1);
        pool.request_arena().unwrap();
        let before = pool.thread_total_allocated_bytes().unwrap();
        let ptr = pool.allocate(8192).unwrap();
        let after = pool.thread_total_allocated_bytes().unwrap();
        assert!(after >= before + 8192);

        let freed_before = pool.thread_total_deallocated_bytes().unwrap();
        unsafe { pool.free(ptr.as_ptr(), 8192) };
        assert!(pool.thread_total_deallocated_bytes().unwrap() >= freed_before + 8192);
    }

    #[test]
    fn test_unknown_arena_is_rejected() {
        let pool = ArenaAllocator::with_pool_size(1);
        assert!(matches!(pool.destroy_arena(4000), Err(Error::UnknownArena(4000))));
        assert!(matches!(pool.reset_arena(4000), Err(Error::UnknownArena(4000))));
    }

    #[test]
    fn test_destroy_bound_arena_of_caller_releases_first() {
        let pool = ArenaAllocator::with_pool_size(2);
        let ptr = pool.allocate(64).unwrap();
        let arena = pool.current_arena().unwrap();
        unsafe { pool.free(ptr.as_ptr(), 64) };

        pool.destroy_arena(arena).unwrap();
        assert_eq!(pool.current_arena(), None);
        let status = pool.status();
        assert_eq!(status.created, 2);
        assert_eq!(status.free.len(), 2);
        assert!(status.bound.is_empty());

        // The refilled pool binds again
        let ptr = pool.allocate(64).unwrap();
        unsafe { pool.free(ptr.as_ptr(), 64) };
    }

    #[test]
    fn test_destroy_refuses_arena_of_other_thread() {
        let pool = ArenaAllocator::with_pool_size(2);
        let (bound_tx, bound_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let worker = pool.clone();
        let handle = thread::spawn(move || {
            bound_tx.send(worker.request_arena().unwrap()).unwrap();
            done_rx.recv().unwrap();
        });

        let arena = bound_rx.recv().unwrap();
        assert!(matches!(pool.destroy_arena(arena), Err(Error::ArenaInUse(a)) if a == arena));

        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_reset_arena_keeps_binding() {
        let pool = ArenaAllocator::with_pool_size(1);
        let _stale = pool.allocate(256).unwrap();
        let arena = pool.current_arena().unwrap();

        pool.reset_arena(arena).unwrap();
        assert_eq!(pool.current_arena(), Some(arena));
        let again = pool.allocate(256).unwrap();
        assert_eq!(pool.look_up(again.as_ptr()).unwrap(), arena);
        unsafe { pool.free(again.as_ptr(), 256) };
    }

    #[test]
    fn test_maintenance_only_touches_free_arenas() {
        let pool = ArenaAllocator::with_pool_size(3);
        let bound = pool.request_arena().unwrap();

        assert_eq!(pool.reset_all_arenas(), 2);
        assert_eq!(pool.destroy_all_arenas(), 2);

        let status = pool.status();
        assert_eq!(status.created, 1);
        assert!(status.free.is_empty());
        assert_eq!(status.bound, vec![bound]);

        // Still usable for the bound thread
        let ptr = pool.allocate(64).unwrap();
        unsafe { pool.free(ptr.as_ptr(), 64) };
    }

    #[test]
    fn test_bindings_to_dropped_pools_are_pruned() {
        let (pool_tx, pool_rx) = std::sync::mpsc::channel::<ArenaAllocator>();
        let (bound_tx, bound_rx) = std::sync::mpsc::channel::<u32>();

        let worker = thread::spawn(move || {
            let original: c_uint = unsafe { ctl::read(ctl::THREAD_ARENA) }.unwrap();
            for pool in pool_rx {
                // Stays bound while the pool is torn down elsewhere
                let arena = pool.request_arena().unwrap();
                drop(pool);
                bound_tx.send(arena).unwrap();
            }

            // Binding again clears the stale entry and unpins its arena
            let fresh = ArenaAllocator::with_pool_size(1);
            fresh.request_arena().unwrap();
            fresh.release_arena();
            let current: c_uint = unsafe { ctl::read(ctl::THREAD_ARENA) }.unwrap();
            (original, current)
        });

        for _ in 0..LOCAL_BINDING_SLOTS * 2 {
            let pool = ArenaAllocator::with_pool_size(1);
            pool_tx.send(pool.clone()).unwrap();
            bound_rx.recv().unwrap();
            drop(pool);
        }
        drop(pool_tx);

        let (original, current) = worker.join().unwrap();
        assert_eq!(current, original);
    }

    #[test]
    fn test_pool_without_extent_hooks() {
        let pool = ArenaAllocator::from_config(&ArenaConfig {
            pool_size: 1,
            extent_hooks: false,
            ..Default::default()
        });
        assert!(pool.extent_hook_stats().is_none());
        let ptr = pool.allocate(1024).unwrap();
        unsafe { pool.free(ptr.as_ptr(), 1024) };
    }
}
