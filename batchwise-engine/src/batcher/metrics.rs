//! Running totals for the batch engine.
//!
//! Totals observe executor outcomes only; nothing here feeds back into
//! scheduling or request results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::BatchResult;

/// Costs are accumulated in millionths to keep them in integer atomics
const COST_SCALE: f64 = 1_000_000.0;

/// Metrics for monitoring batching efficiency
#[derive(Debug, Default)]
pub struct BatchMetrics {
    /// Total requests accepted into the queue
    pub requests_received: AtomicU64,

    /// Requests rejected because the queue was full
    pub requests_rejected: AtomicU64,

    /// Requests cancelled before batching
    pub requests_cancelled: AtomicU64,

    /// Requests resolved successfully by a batch
    pub requests_completed: AtomicU64,

    /// Requests resolved as failed by a batch
    pub requests_failed: AtomicU64,

    /// Number of batches executed
    pub batches_processed: AtomicU64,

    /// Batches where every request failed
    pub batches_failed: AtomicU64,

    /// Total requests in batches (for batch size averaging)
    pub total_batch_requests: AtomicU64,

    /// Total external call time in milliseconds (for averaging)
    pub total_batch_ms: AtomicU64,

    /// Total reported cost, in millionths
    pub total_cost_micros: AtomicU64,

    /// Total estimated savings, in millionths
    pub total_saved_micros: AtomicU64,

    /// Maximum queue depth observed
    pub max_queue_depth: AtomicU64,
}

impl BatchMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record requests accepted into the queue
    pub fn record_received(&self, count: usize) {
        self.requests_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a request rejected due to full queue
    pub fn record_rejected(&self, count: usize) {
        self.requests_rejected.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the deepest queue seen
    pub fn observe_queue_depth(&self, depth: usize) {
        self.max_queue_depth.fetch_max(depth as u64, Ordering::Relaxed);
    }

    /// Record the outcome of one executed batch
    pub fn record_batch(&self, batch: &BatchResult, call_duration: Duration) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.total_batch_requests.fetch_add(batch.size() as u64, Ordering::Relaxed);
        self.total_batch_ms.fetch_add(call_duration.as_millis() as u64, Ordering::Relaxed);
        self.requests_completed.fetch_add(batch.success_count as u64, Ordering::Relaxed);
        self.requests_failed.fetch_add(batch.failure_count as u64, Ordering::Relaxed);
        if batch.success_count == 0 && batch.failure_count > 0 {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_cost_micros.fetch_add(to_micros(batch.total_cost), Ordering::Relaxed);
        self.total_saved_micros.fetch_add(to_micros(batch.total_savings), Ordering::Relaxed);
    }

    /// Requests resolved by batches, successfully or not
    pub fn total_requests_processed(&self) -> u64 {
        self.requests_completed.load(Ordering::Relaxed) + self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost_micros.load(Ordering::Relaxed) as f64 / COST_SCALE
    }

    pub fn total_cost_saved(&self) -> f64 {
        self.total_saved_micros.load(Ordering::Relaxed) as f64 / COST_SCALE
    }

    /// Calculate average batch size
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_processed.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        let total_requests = self.total_batch_requests.load(Ordering::Relaxed);
        total_requests as f64 / batches as f64
    }

    /// Average external call time, if any batch has run
    pub fn avg_batch_duration(&self) -> Option<Duration> {
        let batches = self.batches_processed.load(Ordering::Relaxed);
        if batches == 0 {
            return None;
        }
        let total = self.total_batch_ms.load(Ordering::Relaxed);
        Some(Duration::from_millis(total / batches))
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            total_requests_processed: self.total_requests_processed(),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            avg_batch_size: self.avg_batch_size(),
            avg_batch_ms: self.avg_batch_duration().map_or(0, |d| d.as_millis() as u64),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            total_cost: self.total_cost(),
            total_cost_saved: self.total_cost_saved(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.requests_received,
            &self.requests_rejected,
            &self.requests_cancelled,
            &self.requests_completed,
            &self.requests_failed,
            &self.batches_processed,
            &self.batches_failed,
            &self.total_batch_requests,
            &self.total_batch_ms,
            &self.total_cost_micros,
            &self.total_saved_micros,
            &self.max_queue_depth,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn to_micros(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        (value * COST_SCALE).round() as u64
    } else {
        0
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_rejected: u64,
    pub requests_cancelled: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub total_requests_processed: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub avg_batch_size: f64,
    pub avg_batch_ms: u64,
    pub max_queue_depth: u64,
    pub total_cost: f64,
    pub total_cost_saved: f64,
}
