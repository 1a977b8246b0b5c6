//! Core foundations
//!
//! Error handling and configuration shared by the memory and system modules.

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::Config;
pub use error::{Error, Result};
