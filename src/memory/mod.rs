//! Arena-based memory management
//!
//! Thin typed layer over jemalloc's control interface, the extent hook
//! table installed on pool arenas, the per-thread arena pool and the
//! bump arena carved out of a thread's pool arena.

pub mod arena;
pub mod ctl;
pub mod ehooks;
pub mod thread_local;

pub use arena::{ArenaAllocator, PoolStatus};
pub use ehooks::{ExtentHookStats, ExtentHookTable};
pub use thread_local::{RegionUsage, ThreadLocalArena};
