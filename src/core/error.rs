//! Error types and handling for the arena subsystem
//!
//! Every failure the allocator can report is one variant of [`Error`]:
//! pool exhaustion, native control-call failures and bump-region
//! exhaustion, plus configuration and I/O errors from the ambient stack.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the arena subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No free arena is left to bind to the calling thread
    #[error("All arenas used: pool of {pool_size} arenas is exhausted")]
    PoolExhausted {
        /// Number of arenas in the pool
        pool_size: usize,
    },

    /// A native control-interface call returned a non-zero code
    #[error("Native allocator call `{op}` failed with code {code}")]
    Native {
        /// Control name or entry point that failed
        op: &'static str,
        /// Error code returned by the native allocator
        code: i32,
    },

    /// The native allocator returned null for an arena-scoped request
    #[error("Out of memory: {size} bytes could not be allocated in arena {arena}")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
        /// Arena the request was issued against
        arena: u32,
    },

    /// A bump reservation does not fit in the remaining region
    #[error("Region exhausted: requested {requested} bytes (align {alignment}), {available} available")]
    RegionExhausted {
        /// Requested size in bytes
        requested: usize,
        /// Requested alignment
        alignment: usize,
        /// Bytes left between the free pointer and the region end
        available: usize,
    },

    /// The thread-local region was used before `init`
    #[error("Thread-local region is not initialized")]
    RegionNotInitialized,

    /// Alignment is zero or not a power of two
    #[error("Invalid alignment: {0} is not a power of two")]
    InvalidAlignment(usize),

    /// The arena id was never created by this pool
    #[error("Unknown arena: {0}")]
    UnknownArena(u32),

    /// The arena is bound to a thread other than the caller
    #[error("Arena {0} is bound to another thread")]
    ArenaInUse(u32),

    /// The calling thread is already bound in every binding cache slot
    #[error("Thread holds too many pool bindings (limit {limit})")]
    TooManyBindings {
        /// Bindings one thread can hold at once
        limit: usize,
    },

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a native call error
    pub fn native(op: &'static str, code: i32) -> Self {
        Error::Native { op, code }
    }

    /// Whether the error is a capacity problem (pool or region) rather than a fault
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. } | Error::RegionExhausted { .. } | Error::OutOfMemory { .. }
        )
    }
}
