//! Store Arena - per-thread jemalloc arenas and bump regions
//!
//! A fixed pool of native jemalloc arenas is created up front and each
//! thread that allocates through the pool is bound to one of them, so
//! threads never contend on an arena. On top of a bound arena, a
//! thread-local bump arena hands out aligned slices of one contiguous
//! region that is reclaimed all at once.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;

// Main functional modules
pub mod memory;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::{Config, Error, Result};
pub use memory::{ArenaAllocator, PoolStatus, RegionUsage, ThreadLocalArena};

use crate::core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| Error::config(format!("Failed to install subscriber: {}", e)))?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}

/// Initialize logging and metrics from configuration
pub fn init(config: &Config) -> Result<()> {
    init_logging(&config.logging)?;
    system::metrics::init_registry(config.metrics.enable_prometheus);
    Ok(())
}
