//! Thread-local bump arena
//!
//! One contiguous region is reserved from the calling thread's pool arena
//! and carved up by advancing a free pointer. There is no per-allocation
//! free: the region is reclaimed all at once by [`ThreadLocalArena::clear`]
//! or when the arena is dropped.
//!
//! Invariant: `start <= free_ptr <= end` at all times.

use crate::core::error::{Error, Result};
use crate::memory::arena::ArenaAllocator;
use crate::system::metrics;
use std::fmt;
use std::ptr::NonNull;
use tracing::{debug, error};

/// Alignment of the reserved region itself
pub const REGION_ALIGNMENT: usize = 64;

/// Alignment used by [`ThreadLocalArena::allocate`]
pub const NATURAL_ALIGNMENT: usize = 16;

#[inline]
fn round_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

#[inline]
fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Accounting reported by [`ThreadLocalArena::merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionUsage {
    /// Arena the region was reserved from
    pub arena_index: u32,
    /// Bytes consumed by reservations, including alignment padding
    pub used: usize,
    /// Tail of the region still available
    pub unused: usize,
}

/// Bump allocator over a region owned by one thread.
pub struct ThreadLocalArena {
    pool: ArenaAllocator,
    start: usize,
    end: usize,
    free_ptr: usize,
    arena_index: Option<u32>,
}

impl ThreadLocalArena {
    /// Create an arena with no region yet; call [`init`](Self::init) before use.
    pub fn new(pool: &ArenaAllocator) -> Self {
        Self {
            pool: pool.clone(),
            start: 0,
            end: 0,
            free_ptr: 0,
            arena_index: None,
        }
    }

    /// Reserve a region of `size` bytes from the calling thread's arena.
    ///
    /// Any previous region is released first.
    pub fn init(&mut self, size: usize) -> Result<()> {
        self.release_region();

        let region = self.pool.allocate_aligned(size, REGION_ALIGNMENT).map_err(|e| {
            error!("Failed to reserve thread-local region of {} bytes: {}", size, e);
            e
        })?;

        self.start = region.as_ptr() as usize;
        self.end = self.start + size;
        self.free_ptr = self.start;
        self.arena_index = self.pool.current_arena();
        debug!(
            "Thread-local region [{:#x}, {:#x}) reserved from arena {:?}",
            self.start, self.end, self.arena_index
        );
        Ok(())
    }

    /// Carve `size` bytes aligned to `alignment` out of the region.
    pub fn reserve(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if alignment == 0 || !alignment.is_power_of_two() {
            error!("Rejected reservation with alignment {}", alignment);
            return Err(Error::InvalidAlignment(alignment));
        }
        if self.arena_index.is_none() {
            error!("Reservation of {} bytes on an uninitialized region", size);
            return Err(Error::RegionNotInitialized);
        }

        let fits = round_up(self.free_ptr, alignment)
            .and_then(|aligned| aligned.checked_add(size).map(|next| (aligned, next)))
            .filter(|&(_, next)| next <= self.end);

        let Some((aligned, next)) = fits else {
            let available = self.free_space();
            error!(
                "Thread-local region exhausted: {} bytes (align {}) requested, {} available",
                size, alignment, available
            );
            metrics::record(|m| m.region_exhaustions.inc());
            return Err(Error::RegionExhausted {
                requested: size,
                alignment,
                available,
            });
        };

        debug_assert!(is_aligned(aligned, alignment));
        self.free_ptr = next;
        // aligned >= start > 0
        NonNull::new(aligned as *mut u8).ok_or(Error::RegionNotInitialized)
    }

    /// Whether `address` lies inside the region
    #[inline]
    pub fn owns(&self, address: *const u8) -> bool {
        let address = address as usize;
        self.start <= address && address < self.end
    }

    /// Bytes left between the free pointer and the end of the region
    #[inline]
    pub fn free_space(&self) -> usize {
        self.end - self.free_ptr
    }

    /// Size of the region
    #[inline]
    pub fn total_space(&self) -> usize {
        self.end - self.start
    }

    /// Arena the region was reserved from
    pub fn arena_index(&self) -> Option<u32> {
        self.arena_index
    }

    /// Reserve `size` bytes at natural alignment
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.reserve(size, NATURAL_ALIGNMENT)
    }

    /// Route a deallocation: addresses inside the region are left alone
    /// (they are reclaimed by [`clear`](Self::clear)); anything else is
    /// handed to the pool.
    ///
    /// # Safety
    /// An address outside the region must satisfy [`ArenaAllocator::free`].
    pub unsafe fn deallocate(&mut self, address: *mut u8, size: usize) {
        if address.is_null() || self.owns(address) {
            return;
        }
        unsafe { self.pool.free(address, size) }
    }

    /// Report the region's usage back against its arena.
    pub fn merge(&self) -> Option<RegionUsage> {
        let arena_index = self.arena_index?;
        let usage = RegionUsage {
            arena_index,
            used: self.free_ptr - self.start,
            unused: self.free_space(),
        };
        debug!(
            "Thread-local region of arena {}: {} bytes used, {} returnable",
            usage.arena_index, usage.used, usage.unused
        );
        Some(usage)
    }

    /// Discard every reservation. Pointers handed out earlier must no longer be used.
    pub fn clear(&mut self) {
        self.free_ptr = self.start;
    }

    fn release_region(&mut self) {
        if self.arena_index.take().is_some() {
            unsafe {
                self.pool
                    .free_aligned(self.start as *mut u8, self.total_space(), REGION_ALIGNMENT)
            };
        }
        self.start = 0;
        self.end = 0;
        self.free_ptr = 0;
    }
}

impl Drop for ThreadLocalArena {
    fn drop(&mut self) {
        self.release_region();
    }
}

impl fmt::Debug for ThreadLocalArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalArena")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("free_ptr", &format_args!("{:#x}", self.free_ptr))
            .field("arena_index", &self.arena_index)
            .finish()
    }
}
