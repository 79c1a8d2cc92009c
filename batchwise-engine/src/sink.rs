//! Best-effort persistence of batch telemetry.
//!
//! Sinks are called fire-and-forget after each batch. Their errors are
//! logged and dropped; they never influence request outcomes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::error::SinkError;
use crate::types::{BatchId, BatchResult, RequestType};

/// Telemetry record for one executed batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub request_type: RequestType,
    pub total_requests: usize,
    pub success_count: usize,
    pub total_cost: f64,
    pub savings: f64,
    pub recorded_at: DateTime<Utc>,
}

impl From<&BatchResult> for BatchRecord {
    fn from(batch: &BatchResult) -> Self {
        Self {
            batch_id: batch.batch_id,
            request_type: batch.request_type.clone(),
            total_requests: batch.size(),
            success_count: batch.success_count,
            total_cost: batch.total_cost,
            savings: batch.total_savings,
            recorded_at: Utc::now(),
        }
    }
}

/// Destination for batch telemetry
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn persist(&self, record: BatchRecord) -> Result<(), SinkError>;
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn persist(&self, _record: BatchRecord) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Emits each record as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn persist(&self, record: BatchRecord) -> Result<(), SinkError> {
        info!(
            batch_id = %record.batch_id,
            request_type = %record.request_type,
            total_requests = record.total_requests,
            success_count = record.success_count,
            total_cost = record.total_cost,
            savings = record.savings,
            "Batch metrics"
        );
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<BatchRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<BatchRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn persist(&self, record: BatchRecord) -> Result<(), SinkError> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Posts each record as JSON to an HTTP endpoint
#[derive(Clone)]
pub struct HttpMetricsSink {
    client: Client,
    endpoint: String,
}

impl HttpMetricsSink {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl MetricsSink for HttpMetricsSink {
    async fn persist(&self, record: BatchRecord) -> Result<(), SinkError> {
        let response = self.client.post(&self.endpoint).json(&record).send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
