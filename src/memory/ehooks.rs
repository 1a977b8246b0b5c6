//! Extent hook table installed on pool arenas
//!
//! The native allocator calls these hooks whenever an arena needs to map,
//! unmap, commit, purge, split or merge an extent. The table layout is the
//! native `extent_hooks_t` record, field for field, because the native side
//! reads it directly. Each hook forwards to the allocator's default table
//! (captured from arena 0 when the table is built) and counts what it saw.
//!
//! Hooks run under native allocator locks: they must not log, allocate or
//! block. Only relaxed atomic increments happen here.

use crate::core::error::{Error, Result};
use crate::memory::ctl;
use std::ffi::{c_uint, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

/// Extent allocation hook
pub type ExtentAllocFn = unsafe extern "C" fn(
    hooks: *mut RawExtentHooks,
    new_addr: *mut c_void,
    size: usize,
    alignment: usize,
    zero: *mut bool,
    commit: *mut bool,
    arena_ind: c_uint,
) -> *mut c_void;

/// Extent deallocation hook; returns `true` to opt out and retain the extent
pub type ExtentDallocFn = unsafe extern "C" fn(
    hooks: *mut RawExtentHooks,
    addr: *mut c_void,
    size: usize,
    committed: bool,
    arena_ind: c_uint,
) -> bool;

/// Extent destruction hook
pub type ExtentDestroyFn = unsafe extern "C" fn(
    hooks: *mut RawExtentHooks,
    addr: *mut c_void,
    size: usize,
    committed: bool,
    arena_ind: c_uint,
);

/// Commit, decommit and purge hooks share one shape
pub type ExtentRangeFn = unsafe extern "C" fn(
    hooks: *mut RawExtentHooks,
    addr: *mut c_void,
    size: usize,
    offset: usize,
    length: usize,
    arena_ind: c_uint,
) -> bool;

/// Extent split hook
pub type ExtentSplitFn = unsafe extern "C" fn(
    hooks: *mut RawExtentHooks,
    addr: *mut c_void,
    size: usize,
    size_a: usize,
    size_b: usize,
    committed: bool,
    arena_ind: c_uint,
) -> bool;

/// Extent merge hook
pub type ExtentMergeFn = unsafe extern "C" fn(
    hooks: *mut RawExtentHooks,
    addr_a: *mut c_void,
    size_a: usize,
    addr_b: *mut c_void,
    size_b: usize,
    committed: bool,
    arena_ind: c_uint,
) -> bool;

/// ABI-literal native hook record. Absent slots mean "not supported".
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct RawExtentHooks {
    /// Map a new extent
    pub alloc: Option<ExtentAllocFn>,
    /// Unmap an extent
    pub dalloc: Option<ExtentDallocFn>,
    /// Unconditionally discard an extent
    pub destroy: Option<ExtentDestroyFn>,
    /// Commit pages
    pub commit: Option<ExtentRangeFn>,
    /// Decommit pages
    pub decommit: Option<ExtentRangeFn>,
    /// Advise pages may be reclaimed lazily
    pub purge_lazy: Option<ExtentRangeFn>,
    /// Force pages back to the OS
    pub purge_forced: Option<ExtentRangeFn>,
    /// Split one extent into two
    pub split: Option<ExtentSplitFn>,
    /// Merge two adjacent extents
    pub merge: Option<ExtentMergeFn>,
}

impl RawExtentHooks {
    fn forwarding() -> Self {
        Self {
            alloc: Some(alloc_hook),
            dalloc: Some(dalloc_hook),
            destroy: Some(destroy_hook),
            commit: Some(commit_hook),
            decommit: Some(decommit_hook),
            purge_lazy: Some(purge_lazy_hook),
            purge_forced: Some(purge_forced_hook),
            split: Some(split_hook),
            merge: Some(merge_hook),
        }
    }
}

#[derive(Default)]
struct HookCounters {
    alloc_calls: AtomicU64,
    dalloc_calls: AtomicU64,
    destroy_calls: AtomicU64,
    commit_calls: AtomicU64,
    decommit_calls: AtomicU64,
    purge_lazy_calls: AtomicU64,
    purge_forced_calls: AtomicU64,
    split_calls: AtomicU64,
    merge_calls: AtomicU64,
    failures: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_released: AtomicU64,
}

impl HookCounters {
    #[inline]
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Count a bool-returning hook; `true` from the native side means failure or opt-out
    #[inline]
    fn record(&self, calls: &AtomicU64, declined: bool) -> bool {
        Self::bump(calls, 1);
        if declined {
            Self::bump(&self.failures, 1);
        }
        declined
    }

    fn snapshot(&self) -> ExtentHookStats {
        ExtentHookStats {
            alloc_calls: self.alloc_calls.load(Ordering::Relaxed),
            dalloc_calls: self.dalloc_calls.load(Ordering::Relaxed),
            destroy_calls: self.destroy_calls.load(Ordering::Relaxed),
            commit_calls: self.commit_calls.load(Ordering::Relaxed),
            decommit_calls: self.decommit_calls.load(Ordering::Relaxed),
            purge_lazy_calls: self.purge_lazy_calls.load(Ordering::Relaxed),
            purge_forced_calls: self.purge_forced_calls.load(Ordering::Relaxed),
            split_calls: self.split_calls.load(Ordering::Relaxed),
            merge_calls: self.merge_calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_released: self.bytes_released.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of hook activity across every arena sharing the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentHookStats {
    /// Successful extent allocations
    pub alloc_calls: u64,
    /// Deallocation requests
    pub dalloc_calls: u64,
    /// Destroy requests
    pub destroy_calls: u64,
    /// Commit requests
    pub commit_calls: u64,
    /// Decommit requests
    pub decommit_calls: u64,
    /// Lazy purge requests
    pub purge_lazy_calls: u64,
    /// Forced purge requests
    pub purge_forced_calls: u64,
    /// Split requests
    pub split_calls: u64,
    /// Merge requests
    pub merge_calls: u64,
    /// Requests the default hooks declined or failed
    pub failures: u64,
    /// Bytes handed out by successful allocations
    pub bytes_allocated: u64,
    /// Bytes unmapped by deallocation or destruction
    pub bytes_released: u64,
}

impl ExtentHookStats {
    /// Bytes currently mapped through the hooks
    pub fn bytes_mapped(&self) -> u64 {
        self.bytes_allocated.saturating_sub(self.bytes_released)
    }
}

// The native side only ever sees a pointer to `table`; keeping it the first
// field of a repr(C) struct lets each hook recover the whole state.
#[repr(C)]
struct HookState {
    table: RawExtentHooks,
    defaults: *mut RawExtentHooks,
    counters: HookCounters,
}

#[inline]
unsafe fn state<'a>(hooks: *mut RawExtentHooks) -> &'a HookState {
    unsafe { &*hooks.cast::<HookState>() }
}

unsafe extern "C" fn alloc_hook(
    hooks: *mut RawExtentHooks,
    new_addr: *mut c_void,
    size: usize,
    alignment: usize,
    zero: *mut bool,
    commit: *mut bool,
    arena_ind: c_uint,
) -> *mut c_void {
    let state = unsafe { state(hooks) };
    let counters = &state.counters;
    let addr = match unsafe { (*state.defaults).alloc } {
        Some(alloc) => unsafe { alloc(state.defaults, new_addr, size, alignment, zero, commit, arena_ind) },
        None => ptr::null_mut(),
    };
    if addr.is_null() {
        HookCounters::bump(&counters.failures, 1);
    } else {
        HookCounters::bump(&counters.alloc_calls, 1);
        HookCounters::bump(&counters.bytes_allocated, size as u64);
    }
    addr
}

unsafe extern "C" fn dalloc_hook(
    hooks: *mut RawExtentHooks,
    addr: *mut c_void,
    size: usize,
    committed: bool,
    arena_ind: c_uint,
) -> bool {
    let state = unsafe { state(hooks) };
    let declined = match unsafe { (*state.defaults).dalloc } {
        Some(dalloc) => unsafe { dalloc(state.defaults, addr, size, committed, arena_ind) },
        None => true,
    };
    if !declined {
        HookCounters::bump(&state.counters.bytes_released, size as u64);
    }
    state.counters.record(&state.counters.dalloc_calls, declined)
}

unsafe extern "C" fn destroy_hook(
    hooks: *mut RawExtentHooks,
    addr: *mut c_void,
    size: usize,
    committed: bool,
    arena_ind: c_uint,
) {
    let state = unsafe { state(hooks) };
    HookCounters::bump(&state.counters.destroy_calls, 1);
    if let Some(destroy) = unsafe { (*state.defaults).destroy } {
        unsafe { destroy(state.defaults, addr, size, committed, arena_ind) };
        HookCounters::bump(&state.counters.bytes_released, size as u64);
    }
}

macro_rules! range_hook {
    ($name:ident, $slot:ident, $counter:ident) => {
        unsafe extern "C" fn $name(
            hooks: *mut RawExtentHooks,
            addr: *mut c_void,
            size: usize,
            offset: usize,
            length: usize,
            arena_ind: c_uint,
        ) -> bool {
            let state = unsafe { state(hooks) };
            let declined = match unsafe { (*state.defaults).$slot } {
                Some(hook) => unsafe { hook(state.defaults, addr, size, offset, length, arena_ind) },
                None => true,
            };
            state.counters.record(&state.counters.$counter, declined)
        }
    };
}

range_hook!(commit_hook, commit, commit_calls);
range_hook!(decommit_hook, decommit, decommit_calls);
range_hook!(purge_lazy_hook, purge_lazy, purge_lazy_calls);
range_hook!(purge_forced_hook, purge_forced, purge_forced_calls);

unsafe extern "C" fn split_hook(
    hooks: *mut RawExtentHooks,
    addr: *mut c_void,
    size: usize,
    size_a: usize,
    size_b: usize,
    committed: bool,
    arena_ind: c_uint,
) -> bool {
    let state = unsafe { state(hooks) };
    let declined = match unsafe { (*state.defaults).split } {
        Some(split) => unsafe { split(state.defaults, addr, size, size_a, size_b, committed, arena_ind) },
        None => true,
    };
    state.counters.record(&state.counters.split_calls, declined)
}

unsafe extern "C" fn merge_hook(
    hooks: *mut RawExtentHooks,
    addr_a: *mut c_void,
    size_a: usize,
    addr_b: *mut c_void,
    size_b: usize,
    committed: bool,
    arena_ind: c_uint,
) -> bool {
    let state = unsafe { state(hooks) };
    let declined = match unsafe { (*state.defaults).merge } {
        Some(merge) => unsafe { merge(state.defaults, addr_a, size_a, addr_b, size_b, committed, arena_ind) },
        None => true,
    };
    state.counters.record(&state.counters.merge_calls, declined)
}

/// Heap-pinned hook table handed to `arenas.create`.
///
/// The native allocator keeps the raw pointer for the lifetime of every
/// arena created with it, so the table must outlive those arenas.
pub struct ExtentHookTable {
    state: NonNull<HookState>,
}

// The default table lives in static native memory; counters are atomic.
unsafe impl Send for ExtentHookTable {}
unsafe impl Sync for ExtentHookTable {}

impl ExtentHookTable {
    /// Build a forwarding table over the native defaults.
    pub fn new() -> Result<Self> {
        let defaults: *mut RawExtentHooks = unsafe { ctl::read(ctl::ARENA_EXTENT_HOOKS) }?;
        if defaults.is_null() {
            return Err(Error::native("arena.0.extent_hooks", -1));
        }

        let state = Box::new(HookState {
            table: RawExtentHooks::forwarding(),
            defaults,
            counters: HookCounters::default(),
        });
        Ok(Self {
            state: NonNull::from(Box::leak(state)),
        })
    }

    /// Pointer passed to the native allocator
    pub fn as_raw(&self) -> *mut RawExtentHooks {
        self.state.as_ptr().cast()
    }

    /// Snapshot of hook activity
    pub fn stats(&self) -> ExtentHookStats {
        unsafe { self.state.as_ref() }.counters.snapshot()
    }
}

impl Drop for ExtentHookTable {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.state.as_ptr()) });
    }
}

impl std::fmt::Debug for ExtentHookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentHookTable")
            .field("table", &self.as_raw())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_points_at_forwarding_hooks() {
        let table = ExtentHookTable::new().unwrap();
        let raw = unsafe { &*table.as_raw() };
        assert!(raw.alloc.is_some());
        assert!(raw.merge.is_some());
        assert_eq!(table.stats(), ExtentHookStats::default());
    }

    #[test]
    fn test_bytes_mapped_saturates() {
        let stats = ExtentHookStats {
            bytes_allocated: 10,
            bytes_released: 20,
            ..Default::default()
        };
        assert_eq!(stats.bytes_mapped(), 0);
    }

    #[test]
    fn test_arena_with_table_routes_extents_through_hooks() {
        let table = ExtentHookTable::new().unwrap();
        let raw = table.as_raw();
        let arena: c_uint = unsafe { ctl::exchange(ctl::ARENAS_CREATE, Some(raw)) }.unwrap();

        let ptr = ctl::allocate(4 * 1024 * 1024, None, arena);
        assert!(!ptr.is_null());
        let stats = table.stats();
        assert!(stats.alloc_calls > 0);
        assert!(stats.bytes_mapped() >= 4 * 1024 * 1024);

        unsafe { ctl::deallocate(ptr, 4 * 1024 * 1024, None) };
        ctl::execute_for_arena(ctl::ARENA_DESTROY, arena).unwrap();
        // table dropped after the arena is gone
    }
}
