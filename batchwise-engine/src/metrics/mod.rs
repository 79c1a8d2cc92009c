//! Metrics module for the batch engine
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

pub use prometheus::{encode_metrics, register_metrics, REGISTRY};

/// Register metrics once per process; repeated calls are harmless.
pub fn init_metrics() {
    if let Err(e) = register_metrics() {
        tracing::debug!("Prometheus metrics not registered: {}", e);
    }
}
