//! System utilities and monitoring
//!
//! This module contains the Prometheus metrics for arena lifecycle events.

pub mod metrics;
