//! Batch execution: one external call per batch, fanned back out per request.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::demux::split_response;
use super::metrics::BatchMetrics;
use crate::client::{InferenceCall, InferenceClient, InferenceResponse};
use crate::error::ClientError;
use crate::metrics::prometheus as prom;
use crate::results::ResultStore;
use crate::savings::SavingsEstimator;
use crate::sink::{BatchRecord, MetricsSink};
use crate::templates::TemplateRegistry;
use crate::types::{
    BatchId, BatchResult, FailureKind, InferenceRequest, InferenceResult, RequestType, ResultStatus,
};

/// Requests claimed together, in claim order
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub request_type: RequestType,
    pub requests: Vec<InferenceRequest>,
}

impl Batch {
    pub fn new(request_type: RequestType, requests: Vec<InferenceRequest>) -> Self {
        Self { id: BatchId::new(), request_type, requests }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Executes batches under a shared concurrency limit
pub struct BatchExecutor {
    client: Arc<dyn InferenceClient>,
    templates: Arc<TemplateRegistry>,
    results: Arc<ResultStore>,
    metrics: Arc<BatchMetrics>,
    sink: Arc<dyn MetricsSink>,
    estimator: Arc<dyn SavingsEstimator>,
    /// One permit per concurrently executing batch, across all types
    permits: Arc<Semaphore>,
}

impl BatchExecutor {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        templates: Arc<TemplateRegistry>,
        results: Arc<ResultStore>,
        metrics: Arc<BatchMetrics>,
        sink: Arc<dyn MetricsSink>,
        estimator: Arc<dyn SavingsEstimator>,
        max_parallel_batches: usize,
    ) -> Self {
        Self {
            client,
            templates,
            results,
            metrics,
            sink,
            estimator,
            permits: Arc::new(Semaphore::new(max_parallel_batches)),
        }
    }

    /// Number of batches that could start right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a batch to completion and publish its results.
    ///
    /// Waits for a permit first, so batches beyond the limit queue up in
    /// arrival order. Never fails: every error, including a panicking client,
    /// becomes a per-request result.
    pub async fn execute(&self, batch: Batch) -> BatchResult {
        let _gauge = InFlightGauge::enter();

        let call = self.build_call(&batch);
        let (outcome, elapsed) = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => {
                debug!(batch_id = %batch.id, request_type = %batch.request_type, batch_size = batch.len(), "Executing batch");
                let started = Instant::now();
                let outcome = AssertUnwindSafe(self.client.call(call))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(ClientError::Panicked(panic_message(panic.as_ref()))));
                (outcome, started.elapsed())
            }
            Err(_) => (Err(ClientError::transport("executor is closed")), Duration::ZERO),
        };

        let result = self.resolve(&batch, outcome, elapsed);
        self.results.publish_batch(&result.results);
        self.record(&result, elapsed);
        result
    }

    /// Build the single combined call for a batch
    pub fn build_call(&self, batch: &Batch) -> InferenceCall {
        let template = self.templates.get(&batch.request_type);
        let request_ids: Vec<String> = batch.requests.iter().map(|r| r.id.to_string()).collect();

        InferenceCall {
            prompt: template.render(&batch.requests),
            context: json!({
                "batchId": batch.id.to_string(),
                "requestType": batch.request_type,
                "batchSize": batch.len(),
                "requestIds": request_ids,
            }),
            system_prompt: template.system_prompt.clone(),
            request_type: batch.request_type.clone(),
        }
    }

    /// Turn the collaborator outcome into one result per request, in claim order
    pub fn resolve(
        &self,
        batch: &Batch,
        outcome: Result<InferenceResponse, ClientError>,
        elapsed: Duration,
    ) -> BatchResult {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(batch_id = %batch.id, request_type = %batch.request_type, error = %e, "Batch execution failed");
                return self.fail_all(batch, FailureKind::BatchExecutionError, e.to_string(), None, elapsed);
            }
        };

        let demuxed = match split_response(&response.response, batch.len()) {
            Ok(demuxed) => demuxed,
            Err(e) => {
                warn!(batch_id = %batch.id, request_type = %batch.request_type, error = %e, "Batch response could not be parsed");
                return self.fail_all(
                    batch,
                    FailureKind::BatchParseError,
                    e.to_string(),
                    Some(response.model),
                    elapsed,
                );
            }
        };

        if demuxed.surplus > 0 {
            warn!(batch_id = %batch.id, surplus = demuxed.surplus, "Batch response had extra entries");
        }

        let resolved = demuxed.entries.len();
        let cost_each = if resolved > 0 { response.cost / resolved as f64 } else { 0.0 };
        let mut entries = demuxed.entries.into_iter();

        let results: Vec<InferenceResult> = batch
            .requests
            .iter()
            .map(|request| match entries.next() {
                Some(value) => InferenceResult::completed(
                    request,
                    batch.id,
                    value,
                    cost_each,
                    &response.model,
                    response.from_cache,
                ),
                None => InferenceResult::failed(
                    request,
                    batch.id,
                    FailureKind::MissingInBatchResponse,
                    format!("Response contained {} of {} entries", resolved, batch.len()),
                ),
            })
            .collect();

        if resolved < batch.len() {
            warn!(
                batch_id = %batch.id,
                resolved,
                expected = batch.len(),
                "Batch response was missing entries"
            );
        }

        let total_cost = cost_each * resolved as f64;
        let total_savings = self.estimator.savings(&batch.request_type, resolved, total_cost);

        BatchResult {
            batch_id: batch.id,
            request_type: batch.request_type.clone(),
            success_count: resolved,
            failure_count: batch.len() - resolved,
            total_cost,
            total_savings,
            model_used: Some(response.model),
            processing_time_ms: elapsed.as_millis() as u64,
            results,
        }
    }

    fn fail_all(
        &self,
        batch: &Batch,
        kind: FailureKind,
        message: String,
        model_used: Option<String>,
        elapsed: Duration,
    ) -> BatchResult {
        let results = batch
            .requests
            .iter()
            .map(|request| InferenceResult::failed(request, batch.id, kind, message.clone()))
            .collect();

        BatchResult {
            batch_id: batch.id,
            request_type: batch.request_type.clone(),
            success_count: 0,
            failure_count: batch.len(),
            total_cost: 0.0,
            total_savings: 0.0,
            model_used,
            processing_time_ms: elapsed.as_millis() as u64,
            results,
        }
    }

    /// Update totals and hand the batch record to the sink without waiting
    fn record(&self, result: &BatchResult, elapsed: Duration) {
        self.metrics.record_batch(result, elapsed);

        let request_type = result.request_type.as_str();
        let outcome = batch_outcome(result);
        prom::record_batch(request_type, outcome, result.size(), elapsed.as_secs_f64());
        prom::record_requests(request_type, ResultStatus::Completed.as_str(), result.success_count);
        prom::record_requests(request_type, ResultStatus::Failed.as_str(), result.failure_count);
        prom::record_cost(request_type, result.total_cost, result.total_savings);

        info!(
            batch_id = %result.batch_id,
            request_type = %result.request_type,
            batch_size = result.size(),
            success = result.success_count,
            failed = result.failure_count,
            cost = result.total_cost,
            savings = result.total_savings,
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch complete"
        );

        let sink = self.sink.clone();
        let record = BatchRecord::from(result);
        tokio::spawn(async move {
            if let Err(e) = sink.persist(record).await {
                warn!(error = %e, "Failed to persist batch metrics");
            }
        });
    }
}

/// Holds the in-flight gauge up for as long as a batch is executing
struct InFlightGauge;

impl InFlightGauge {
    fn enter() -> Self {
        prom::inc_in_flight();
        Self
    }
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        prom::dec_in_flight();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn batch_outcome(result: &BatchResult) -> &'static str {
    match result.results.first().and_then(InferenceResult::failure_kind) {
        _ if result.failure_count == 0 => "success",
        Some(FailureKind::BatchExecutionError) => "execution_error",
        Some(FailureKind::BatchParseError) => "parse_error",
        _ => "partial",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{SimulatedClient, SimulatedReply};
    use crate::error::SinkError;
    use crate::savings::FixedMultiplier;
    use crate::sink::MemorySink;
    use crate::types::ResultLookup;
    use async_trait::async_trait;
    use serde_json::Value;

    struct FailingSink;

    struct PanickingClient;

    #[async_trait]
    impl InferenceClient for PanickingClient {
        async fn call(&self, _call: InferenceCall) -> Result<InferenceResponse, ClientError> {
            panic!("model runtime crashed");
        }
    }

    #[async_trait]
    impl MetricsSink for FailingSink {
        async fn persist(&self, _record: BatchRecord) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("database offline".to_string()))
        }
    }

    fn executor_with(
        client: Arc<SimulatedClient>,
        sink: Arc<dyn MetricsSink>,
        max_parallel: usize,
    ) -> (BatchExecutor, Arc<ResultStore>, Arc<BatchMetrics>) {
        let results = Arc::new(ResultStore::new());
        let metrics = Arc::new(BatchMetrics::new());
        let executor = BatchExecutor::new(
            client,
            Arc::new(TemplateRegistry::builtin()),
            results.clone(),
            metrics.clone(),
            sink,
            Arc::new(FixedMultiplier(2.5)),
            max_parallel,
        );
        (executor, results, metrics)
    }

    fn batch_of(n: usize) -> Batch {
        let requests = (0..n)
            .map(|i| InferenceRequest::new(RequestType::BILLING_CODES, json!({ "note": i })))
            .collect();
        Batch::new(RequestType::BILLING_CODES, requests)
    }

    #[tokio::test]
    async fn test_results_align_with_claim_order() {
        for size in 1..=5 {
            let client = Arc::new(SimulatedClient::new().with_cost_per_item(0.1));
            let (executor, results, _) = executor_with(client.clone(), Arc::new(MemorySink::new()), 1);
            let batch = batch_of(size);
            let ids: Vec<_> = batch.requests.iter().map(|r| r.id).collect();
            results.mark_in_flight(ids.iter());

            let outcome = executor.execute(batch).await;

            assert_eq!(client.call_count(), 1);
            assert_eq!(outcome.success_count, size);
            for (i, result) in outcome.results.iter().enumerate() {
                assert_eq!(result.request_id, ids[i]);
                assert_eq!(result.result, Some(json!({ "echo": { "note": i } })));
                assert!((result.cost - 0.1).abs() < 1e-9);
                assert_eq!(results.lookup(&ids[i]), ResultLookup::Ready(result.clone()));
            }
            assert_eq!(results.in_flight_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_malformed_response_fails_whole_batch() {
        let client = Arc::new(SimulatedClient::new().with_default_reply(SimulatedReply::Malformed));
        let (executor, _, metrics) = executor_with(client, Arc::new(MemorySink::new()), 1);

        let outcome = executor.execute(batch_of(4)).await;
        assert_eq!(outcome.failure_count, 4);
        assert_eq!(outcome.total_cost, 0.0);
        for result in &outcome.results {
            assert_eq!(result.status, ResultStatus::Failed);
            assert_eq!(result.failure_kind(), Some(FailureKind::BatchParseError));
            assert_eq!(result.cost, 0.0);
        }
        assert_eq!(batch_outcome(&outcome), "parse_error");
        assert_eq!(metrics.snapshot().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_truncated_response_fails_only_tail() {
        let client = Arc::new(
            SimulatedClient::new()
                .with_cost_per_item(0.1)
                .with_default_reply(SimulatedReply::Truncated(2)),
        );
        let (executor, _, _) = executor_with(client, Arc::new(MemorySink::new()), 1);

        // Reported cost is 0.4 for 4 items, spread over the 2 that resolved
        let outcome = executor.execute(batch_of(4)).await;
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failure_count, 2);
        assert!((outcome.results[0].cost - 0.2).abs() < 1e-9);
        assert!((outcome.results[1].cost - 0.2).abs() < 1e-9);
        assert_eq!(outcome.results[2].failure_kind(), Some(FailureKind::MissingInBatchResponse));
        assert_eq!(outcome.results[3].failure_kind(), Some(FailureKind::MissingInBatchResponse));
        assert_eq!(outcome.results[3].cost, 0.0);
        assert!((outcome.total_cost - 0.4).abs() < 1e-9);
        assert_eq!(batch_outcome(&outcome), "partial");
    }

    #[tokio::test]
    async fn test_call_failure_fails_whole_batch() {
        let client = Arc::new(
            SimulatedClient::new().with_default_reply(SimulatedReply::Fail("gateway timeout".to_string())),
        );
        let (executor, _, _) = executor_with(client, Arc::new(MemorySink::new()), 1);

        let outcome = executor.execute(batch_of(3)).await;
        assert_eq!(outcome.failure_count, 3);
        for result in &outcome.results {
            assert_eq!(result.failure_kind(), Some(FailureKind::BatchExecutionError));
            assert_eq!(result.cost, 0.0);
            assert!(result.error.as_ref().unwrap().message.contains("gateway timeout"));
        }
    }

    #[tokio::test]
    async fn test_client_panic_fails_whole_batch() {
        let results = Arc::new(ResultStore::new());
        let executor = BatchExecutor::new(
            Arc::new(PanickingClient),
            Arc::new(TemplateRegistry::builtin()),
            results.clone(),
            Arc::new(BatchMetrics::new()),
            Arc::new(MemorySink::new()),
            Arc::new(FixedMultiplier(2.5)),
            1,
        );
        let batch = batch_of(3);
        results.mark_in_flight(batch.requests.iter().map(|r| &r.id));

        let outcome = executor.execute(batch).await;
        assert_eq!(outcome.failure_count, 3);
        for result in &outcome.results {
            assert_eq!(result.failure_kind(), Some(FailureKind::BatchExecutionError));
            assert!(result.error.as_ref().unwrap().message.contains("model runtime crashed"));
        }
        assert_eq!(results.in_flight_count(), 0);
        assert_eq!(batch_outcome(&outcome), "execution_error");

        // The permit was released despite the panic
        assert_eq!(executor.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_savings_use_estimator() {
        let client = Arc::new(SimulatedClient::new().with_cost_per_item(0.2));
        let (executor, _, metrics) = executor_with(client, Arc::new(MemorySink::new()), 1);

        let outcome = executor.execute(batch_of(5)).await;
        // cost 1.0, estimated individual 2.5
        assert!((outcome.total_savings - 1.5).abs() < 1e-9);
        assert!((metrics.total_cost_saved() - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_affect_results() {
        let client = Arc::new(SimulatedClient::new());
        let (executor, _, _) = executor_with(client, Arc::new(FailingSink), 1);

        let outcome = executor.execute(batch_of(2)).await;
        assert_eq!(outcome.success_count, 2);
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_sink_receives_record() {
        let client = Arc::new(SimulatedClient::new());
        let sink = Arc::new(MemorySink::new());
        let (executor, _, _) = executor_with(client, sink.clone(), 1);

        let outcome = executor.execute(batch_of(2)).await;
        for _ in 0..10 {
            if !sink.records().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].batch_id, outcome.batch_id);
        assert_eq!(records[0].total_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_batches_are_bounded() {
        let client = Arc::new(SimulatedClient::new().with_latency(Duration::from_millis(500)));
        let (executor, _, _) = executor_with(client.clone(), Arc::new(MemorySink::new()), 2);
        let executor = Arc::new(executor);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.execute(batch_of(1)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(client.call_count(), 5);
        assert_eq!(client.peak_concurrency(), 2);
        assert_eq!(executor.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_build_call_context() {
        let client = Arc::new(SimulatedClient::new());
        let (executor, _, _) = executor_with(client, Arc::new(MemorySink::new()), 1);
        let batch = batch_of(3);

        let call = executor.build_call(&batch);
        assert_eq!(call.batch_size(), 3);
        assert_eq!(call.context["requestType"], "billing_codes");
        assert_eq!(call.context["requestIds"].as_array().map(Vec::len), Some(3));
        assert!(call.system_prompt.contains("clinical"));
        assert!(call.context["batchId"].as_str().map_or(false, |s| s.starts_with("batch-")));
        assert!(matches!(call.context["batchSize"], Value::Number(_)));
    }
}
