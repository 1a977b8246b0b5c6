//! Metrics collection for the arena subsystem
//!
//! Prometheus counters for arena lifecycle events. The allocation hot path
//! records nothing; only binding, release, exhaustion and native failures
//! are counted, and each record is a single atomic increment.

use crate::core::error::Result;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Counters for arena pool and bump region events
pub struct Metrics {
    /// Arenas created through the native control interface
    pub arenas_created: IntCounter,
    /// Thread-to-arena bindings established
    pub bindings: IntCounter,
    /// Explicit binding releases
    pub releases: IntCounter,
    /// Binding requests rejected because every arena was bound
    pub pool_exhaustions: IntCounter,
    /// Native control or allocation calls that failed
    pub native_failures: IntCounter,
    /// Bump reservations that did not fit their region
    pub region_exhaustions: IntCounter,
}

impl Metrics {
    /// Create and register the counters with the default Prometheus registry
    pub fn new() -> Result<Self> {
        Ok(Self {
            arenas_created: register_int_counter!(
                "arena_created_total",
                "Total number of arenas created"
            )?,
            bindings: register_int_counter!(
                "arena_bindings_total",
                "Total number of thread-to-arena bindings"
            )?,
            releases: register_int_counter!(
                "arena_releases_total",
                "Total number of explicit arena releases"
            )?,
            pool_exhaustions: register_int_counter!(
                "arena_pool_exhausted_total",
                "Total number of binding requests rejected by an exhausted pool"
            )?,
            native_failures: register_int_counter!(
                "arena_native_failures_total",
                "Total number of failed native allocator calls"
            )?,
            region_exhaustions: register_int_counter!(
                "arena_region_exhausted_total",
                "Total number of bump reservations that did not fit"
            )?,
        })
    }

    /// Get the global metrics instance, or `None` if registration failed
    pub fn global() -> Option<&'static Metrics> {
        static INSTANCE: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::new() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                error!("Failed to register arena metrics: {}", e);
                None
            }
        });
        INSTANCE.as_ref()
    }
}

/// Apply `f` to the global metrics when recording is enabled
#[inline]
pub fn record(f: impl FnOnce(&Metrics)) {
    if ENABLED.load(Ordering::Relaxed) {
        if let Some(metrics) = Metrics::global() {
            f(metrics);
        }
    }
}

/// Initialize the metrics registry and turn recording on or off
///
/// This function should be called once during application startup.
pub fn init_registry(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
    if enabled {
        let _ = Metrics::global();
    }
}

/// Collect and return all metrics as a Prometheus-formatted string
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
