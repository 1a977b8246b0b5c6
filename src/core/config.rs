//! Configuration management for the arena subsystem
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `ARENA_*` environment variables, then validation.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "store-arena.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Arena pool and bump region settings
    pub arena: ArenaConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics and monitoring
    pub metrics: MetricsConfig,
}

/// Arena pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Number of arenas to pre-create (0 = hardware concurrency)
    pub pool_size: usize,

    /// Install the forwarding extent hook table on every arena
    pub extent_hooks: bool,

    /// Default size of a thread-local bump region (bytes)
    pub region_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (full, compact)
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register Prometheus counters for arena lifecycle events
    pub enable_prometheus: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            pool_size: 0, // Auto-detect
            extent_hooks: true,
            region_size: 1024 * 1024, // 1MB
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_prometheus: true,
        }
    }
}

impl ArenaConfig {
    /// Pool size with `0` resolved to the host's hardware concurrency
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            num_cpus::get().max(1)
        } else {
            self.pool_size
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(size) = env::var("ARENA_POOL_SIZE") {
            self.arena.pool_size = size.parse()
                .map_err(|e| Error::config(format!("Invalid pool size: {}", e)))?;
        }

        if let Ok(hooks) = env::var("ARENA_EXTENT_HOOKS") {
            self.arena.extent_hooks = hooks.parse()
                .map_err(|e| Error::config(format!("Invalid extent hooks flag: {}", e)))?;
        }

        if let Ok(size) = env::var("ARENA_REGION_SIZE") {
            self.arena.region_size = size.parse()
                .map_err(|e| Error::config(format!("Invalid region size: {}", e)))?;
        }

        if let Ok(level) = env::var("ARENA_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("ARENA_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Arena indices are encoded in 12 bits of the native allocation flags
        if self.arena.pool_size > 4095 {
            return Err(Error::config("Too many arenas (maximum 4095)"));
        }

        if self.arena.region_size == 0 {
            return Err(Error::config("Region size must be non-zero"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "full" | "compact" => {}
            _ => return Err(Error::config("Invalid log format (expected full or compact)")),
        }

        Ok(())
    }
}
