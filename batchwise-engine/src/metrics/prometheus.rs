//! Prometheus metrics for the batch engine
//!
//! Metrics live in a process-wide registry under the `batchwise` namespace.
//! They are updated regardless of registration; registration only makes them
//! visible to [`encode_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for batchwise metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Batch Metrics ==============

    /// Executed batches by request type and outcome (success, partial, parse_error, execution_error)
    pub static ref BATCHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("batches_total", "Total number of executed batches")
            .namespace("batchwise"),
        &["request_type", "outcome"]
    ).expect("metric can be created");

    /// Batch size histogram by request type
    pub static ref BATCH_SIZE: HistogramVec = HistogramVec::new(
        HistogramOpts::new("batch_size", "Number of requests per executed batch")
            .namespace("batchwise")
            .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0, 10.0, 15.0, 25.0, 50.0]),
        &["request_type"]
    ).expect("metric can be created");

    /// External call duration by request type
    pub static ref BATCH_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("batch_duration_seconds", "Duration of the external call per batch")
            .namespace("batchwise")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["request_type"]
    ).expect("metric can be created");

    /// Batches currently executing or waiting for a permit
    pub static ref IN_FLIGHT_BATCHES: Gauge = Gauge::with_opts(
        Opts::new("in_flight_batches", "Number of batches cut but not yet resolved")
            .namespace("batchwise")
    ).expect("metric can be created");

    // ============== Request Metrics ==============

    /// Resolved requests by request type and terminal status
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of resolved requests")
            .namespace("batchwise"),
        &["request_type", "status"]
    ).expect("metric can be created");

    /// Queued requests by request type
    pub static ref QUEUE_DEPTH: GaugeVec = GaugeVec::new(
        Opts::new("queue_depth", "Requests waiting to be batched")
            .namespace("batchwise"),
        &["request_type"]
    ).expect("metric can be created");

    // ============== Cost Metrics ==============

    /// Reported cost of executed batches
    pub static ref COST_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cost_total", "Total reported inference cost")
            .namespace("batchwise"),
        &["request_type"]
    ).expect("metric can be created");

    /// Estimated savings versus individual calls
    pub static ref SAVINGS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("savings_total", "Estimated cost saved by batching")
            .namespace("batchwise"),
        &["request_type"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Fails with `AlreadyReg` when called twice.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(BATCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(BATCH_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(IN_FLIGHT_BATCHES.clone()))?;
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(COST_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SAVINGS_TOTAL.clone()))?;
    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Record one executed batch.
pub fn record_batch(request_type: &str, outcome: &str, size: usize, duration_secs: f64) {
    BATCHES_TOTAL.with_label_values(&[request_type, outcome]).inc();
    BATCH_SIZE.with_label_values(&[request_type]).observe(size as f64);
    BATCH_DURATION_SECONDS.with_label_values(&[request_type]).observe(duration_secs);
}

/// Record resolved requests of one status.
pub fn record_requests(request_type: &str, status: &str, count: usize) {
    if count > 0 {
        REQUESTS_TOTAL.with_label_values(&[request_type, status]).inc_by(count as f64);
    }
}

/// Record cost and estimated savings of a batch.
pub fn record_cost(request_type: &str, cost: f64, savings: f64) {
    if cost > 0.0 {
        COST_TOTAL.with_label_values(&[request_type]).inc_by(cost);
    }
    if savings > 0.0 {
        SAVINGS_TOTAL.with_label_values(&[request_type]).inc_by(savings);
    }
}

/// Update the queue depth gauge for a type.
pub fn set_queue_depth(request_type: &str, depth: usize) {
    QUEUE_DEPTH.with_label_values(&[request_type]).set(depth as f64);
}

pub fn inc_in_flight() {
    IN_FLIGHT_BATCHES.inc();
}

pub fn dec_in_flight() {
    IN_FLIGHT_BATCHES.dec();
}
