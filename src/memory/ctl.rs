//! Typed access to the native allocator's control interface
//!
//! jemalloc exposes its knobs through `mallctl`, addressed by dotted names
//! such as `arenas.create` or `thread.arena`. The helpers here hide the
//! void-pointer plumbing and turn non-zero return codes into
//! [`Error::Native`]. Names are a fixed external protocol.

use crate::core::error::{Error, Result};
use jemalloc_sys as ffi;
use std::ffi::{c_int, CStr};
use std::mem::{self, MaybeUninit};
use std::ptr;

/// Arena jemalloc creates at startup; never part of a pool
pub const DEFAULT_ARENA: u32 = 0;

/// Create a new arena, optionally with an extent hook table
pub const ARENAS_CREATE: &CStr = c"arenas.create";
/// Arena index owning an address
pub const ARENAS_LOOKUP: &CStr = c"arenas.lookup";
/// Destroy an arena (index substituted at MIB position 1)
pub const ARENA_DESTROY: &CStr = c"arena.0.destroy";
/// Discard all allocations of an arena (index substituted at MIB position 1)
pub const ARENA_RESET: &CStr = c"arena.0.reset";
/// Extent hooks of arena 0, i.e. the native defaults
pub const ARENA_EXTENT_HOOKS: &CStr = c"arena.0.extent_hooks";
/// Arena the calling thread uses for untagged allocations
pub const THREAD_ARENA: &CStr = c"thread.arena";
/// Cumulative bytes allocated by the calling thread
pub const THREAD_ALLOCATED: &CStr = c"thread.allocated";
/// Cumulative bytes deallocated by the calling thread
pub const THREAD_DEALLOCATED: &CStr = c"thread.deallocated";
/// Flush the calling thread's cache
pub const THREAD_TCACHE_FLUSH: &CStr = c"thread.tcache.flush";

fn op_name(name: &'static CStr) -> &'static str {
    name.to_str().unwrap_or("mallctl")
}

/// Read the value stored under `name`, optionally writing `input` in the same call.
///
/// # Safety
/// `T` and `N` must match the types the native allocator expects for `name`.
pub unsafe fn exchange<T: Copy, N>(name: &'static CStr, input: Option<N>) -> Result<T> {
    let mut value = MaybeUninit::<T>::uninit();
    let mut len = mem::size_of::<T>();
    let mut input = input;
    let (newp, newlen) = match input.as_mut() {
        Some(new) => ((new as *mut N).cast(), mem::size_of::<N>()),
        None => (ptr::null_mut(), 0),
    };

    let code = unsafe { ffi::mallctl(name.as_ptr(), value.as_mut_ptr().cast(), &mut len, newp, newlen) };
    if code != 0 {
        return Err(Error::native(op_name(name), code));
    }
    Ok(unsafe { value.assume_init() })
}

/// Read the value stored under `name`.
///
/// # Safety
/// `T` must match the type the native allocator stores under `name`.
pub unsafe fn read<T: Copy>(name: &'static CStr) -> Result<T> {
    unsafe { exchange::<T, ()>(name, None) }
}

/// Run a control that takes no input and produces no output.
pub fn execute(name: &'static CStr) -> Result<()> {
    let code = unsafe {
        ffi::mallctl(name.as_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut(), 0)
    };
    if code != 0 {
        return Err(Error::native(op_name(name), code));
    }
    Ok(())
}

/// Run a per-arena control such as `arena.0.destroy` against `arena`.
///
/// The name is resolved to a MIB once and the arena index is patched into
/// its second component, so no name string is built per call.
pub fn execute_for_arena(template: &'static CStr, arena: u32) -> Result<()> {
    let mut mib = [0usize; 3];
    let mut len = mib.len();

    let code = unsafe { ffi::mallctlnametomib(template.as_ptr(), mib.as_mut_ptr(), &mut len) };
    if code != 0 {
        return Err(Error::native("mallctlnametomib", code));
    }

    mib[1] = arena as usize;
    let code = unsafe {
        ffi::mallctlbymib(mib.as_ptr(), len, ptr::null_mut(), ptr::null_mut(), ptr::null_mut(), 0)
    };
    if code != 0 {
        return Err(Error::native(op_name(template), code));
    }
    Ok(())
}

/// Allocation flags pinning a request to `arena` and bypassing the thread cache.
#[inline]
pub fn arena_flags(arena: u32) -> c_int {
    ffi::MALLOCX_ARENA(arena as usize) | ffi::MALLOCX_TCACHE_NONE
}

/// Arena-scoped allocation. Returns null on failure.
///
/// `alignment` must be a power of two when given.
#[inline]
pub fn allocate(size: usize, alignment: Option<usize>, arena: u32) -> *mut u8 {
    let mut flags = arena_flags(arena);
    if let Some(alignment) = alignment {
        flags |= ffi::MALLOCX_ALIGN(alignment);
    }
    // size 0 is undefined for mallocx
    unsafe { ffi::mallocx(size.max(1), flags).cast() }
}

/// Release memory returned by [`allocate`].
///
/// A `size` of 0 means the size is unknown and the allocator looks it up.
///
/// # Safety
/// `ptr` must come from [`allocate`] with the same `alignment`, and with
/// the same `size` unless `size` is 0. It must not be used afterwards.
#[inline]
pub unsafe fn deallocate(ptr: *mut u8, size: usize, alignment: Option<usize>) {
    let mut flags = ffi::MALLOCX_TCACHE_NONE;
    if let Some(alignment) = alignment {
        flags |= ffi::MALLOCX_ALIGN(alignment);
    }
    if size == 0 {
        unsafe { ffi::dallocx(ptr.cast(), flags) }
    } else {
        unsafe { ffi::sdallocx(ptr.cast(), size, flags) }
    }
}
