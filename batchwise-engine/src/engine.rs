//! Caller-facing batch engine.
//!
//! [`BatchEngine`] owns the queue, the per-type batch windows, the executor and
//! the result store. It is a cheap `Clone` handle; all clones share state.
//! Background work (window timers and batch execution) runs on the tokio
//! runtime that was current when the engine was built, so callers may enqueue
//! from synchronous code.
//!
//! Locks are always taken in the order windows, queue, result store, and none
//! is held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batcher::{
    Batch, BatchExecutor, BatchMetrics, BatchWindow, EngineConfig, MetricsSnapshot, RequestQueue,
    Step, Trigger,
};
use crate::client::InferenceClient;
use crate::error::EngineError;
use crate::metrics::{self, prometheus as prom};
use crate::results::{wait_for_result, ResultStore};
use crate::savings::{FixedMultiplier, SavingsEstimator};
use crate::sink::{MetricsSink, TracingSink};
use crate::templates::TemplateRegistry;
use crate::types::{
    BatchResult, EnqueueOptions, Enqueued, InferenceRequest, InferenceResult, Priority, QueueStats,
    RequestId, RequestType, ResultLookup, ResultStatus,
};

/// Window and timer for one request type
struct TypeSlot {
    window: BatchWindow,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every arm and disarm; a timer only acts if its generation is current
    generation: u64,
}

impl TypeSlot {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }
}

/// Counts a dispatched batch until its task finishes, unwinds or is dropped
struct ActiveBatch(Arc<AtomicUsize>);

impl ActiveBatch {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveBatch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct EngineInner {
    config: EngineConfig,
    queue: RequestQueue,
    results: Arc<ResultStore>,
    executor: Arc<BatchExecutor>,
    metrics: Arc<BatchMetrics>,
    slots: Mutex<HashMap<RequestType, TypeSlot>>,
    active_batches: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
    runtime: Handle,
}

impl EngineInner {
    /// Evaluate a type's window until it settles, applying each step.
    ///
    /// Returns the handles of the batches cut during this evaluation.
    fn drive(self: &Arc<Self>, request_type: &RequestType, trigger: Trigger) -> Vec<JoinHandle<BatchResult>> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(request_type.clone()).or_insert_with(|| TypeSlot {
            window: BatchWindow::new(
                self.config.batch_config_for(request_type),
                self.config.grace_period_for(request_type),
            ),
            timer: None,
            generation: 0,
        });
        self.run_window(slot, request_type, trigger)
    }

    fn run_window(
        self: &Arc<Self>,
        slot: &mut TypeSlot,
        request_type: &RequestType,
        trigger: Trigger,
    ) -> Vec<JoinHandle<BatchResult>> {
        let mut handles = Vec::new();
        let mut trigger = trigger;

        loop {
            let backlog = self.queue.backlog(request_type);
            match slot.window.evaluate(trigger, backlog, Instant::now()) {
                Step::Cut(size) => {
                    if let Some(batch) = self.cut(request_type, size) {
                        info!(
                            batch_id = %batch.id,
                            request_type = %request_type,
                            batch_size = batch.len(),
                            queued = backlog.len,
                            trigger = ?trigger,
                            "Batch cut"
                        );
                        handles.push(self.dispatch(batch));
                    }
                    if trigger != Trigger::Flush {
                        trigger = Trigger::Arrival;
                    }
                }
                Step::Arm(deadline) => {
                    self.arm(slot, request_type, deadline);
                    break;
                }
                Step::Hold => break,
                Step::Idle => {
                    slot.disarm();
                    break;
                }
            }
        }

        prom::set_queue_depth(request_type.as_str(), self.queue.backlog(request_type).len);
        handles
    }

    /// Claim up to `size` requests in priority order.
    ///
    /// Ids that disappear between peek and claim (cancelled meanwhile) are
    /// skipped and the remainder is topped up from the queue.
    fn cut(&self, request_type: &RequestType, size: usize) -> Option<Batch> {
        let mut claimed: Vec<InferenceRequest> = Vec::with_capacity(size);

        while claimed.len() < size {
            let candidates = self.queue.peek_ordered(request_type, size - claimed.len());
            if candidates.is_empty() {
                break;
            }
            let ids: Vec<RequestId> = candidates.iter().map(|r| r.id).collect();
            let claim = self.queue.claim(&ids);
            let partial = claim.is_partial();
            if partial {
                debug!(request_type = %request_type, missing = claim.missing.len(), "Partial claim, retrying");
            }
            claimed.extend(claim.claimed);
            if !partial {
                break;
            }
        }

        if claimed.is_empty() {
            None
        } else {
            Some(Batch::new(request_type.clone(), claimed))
        }
    }

    fn dispatch(&self, batch: Batch) -> JoinHandle<BatchResult> {
        let executor = self.executor.clone();
        let active = ActiveBatch::start(&self.active_batches);

        self.runtime.spawn(async move {
            let _active = active;
            executor.execute(batch).await
        })
    }

    /// Replace the type's timer with one firing at `deadline`
    fn arm(self: &Arc<Self>, slot: &mut TypeSlot, request_type: &RequestType, deadline: Instant) {
        slot.disarm();
        let generation = slot.generation;
        let engine: Weak<EngineInner> = Arc::downgrade(self);
        let request_type = request_type.clone();

        debug!(
            request_type = %request_type,
            in_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Batch window armed"
        );

        slot.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(engine) = engine.upgrade() {
                engine.on_timer(&request_type, generation);
            }
        }));
    }

    fn on_timer(self: &Arc<Self>, request_type: &RequestType, generation: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(request_type) else {
            return;
        };
        if slot.generation != generation {
            // Superseded by a newer arm or a disarm
            return;
        }
        // This task is the timer; let it finish on its own
        slot.timer = None;
        self.run_window(slot, request_type, Trigger::TimerFired);
    }

    fn disarm_all(&self) {
        for slot in self.slots.lock().values_mut() {
            slot.disarm();
        }
    }

    fn ensure_accepting(&self) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn note_enqueue_error(&self, error: &EngineError, count: usize) {
        if matches!(error, EngineError::QueueFull { .. }) {
            self.metrics.record_rejected(count);
        }
        warn!(error = %error, count, "Enqueue rejected");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values_mut() {
            slot.disarm();
        }
    }
}

/// Builder for [`BatchEngine`] with optional collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    client: Arc<dyn InferenceClient>,
    sink: Option<Arc<dyn MetricsSink>>,
    templates: Option<TemplateRegistry>,
    estimator: Option<Arc<dyn SavingsEstimator>>,
}

impl EngineBuilder {
    /// Where batch telemetry goes (default: [`TracingSink`])
    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Prompt templates (default: [`TemplateRegistry::builtin`])
    pub fn templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Savings estimator (default: [`FixedMultiplier`] with the configured multiplier)
    pub fn estimator(mut self, estimator: Arc<dyn SavingsEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Validate the configuration and start the engine on the current runtime.
    pub fn build(self) -> Result<BatchEngine, EngineError> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|e| EngineError::NoRuntime(e.to_string()))?;
        metrics::init_metrics();

        let results = Arc::new(ResultStore::new());
        let batch_metrics = Arc::new(BatchMetrics::new());
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(FixedMultiplier(self.config.savings_multiplier)));
        let executor = Arc::new(BatchExecutor::new(
            self.client,
            Arc::new(self.templates.unwrap_or_default()),
            results.clone(),
            batch_metrics.clone(),
            self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            estimator,
            self.config.max_parallel_batches,
        ));

        info!(
            max_parallel_batches = self.config.max_parallel_batches,
            max_queue = self.config.max_queue_total,
            type_overrides = self.config.type_overrides.len(),
            "Batch engine started"
        );

        Ok(BatchEngine {
            inner: Arc::new(EngineInner {
                queue: RequestQueue::new(results.clone(), self.config.max_queue_total),
                config: self.config,
                results,
                executor,
                metrics: batch_metrics,
                slots: Mutex::new(HashMap::new()),
                active_batches: Arc::new(AtomicUsize::new(0)),
                shutting_down: AtomicBool::new(false),
                runtime,
            }),
        })
    }
}

/// Request batching engine
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

impl BatchEngine {
    /// Engine with default templates, sink and savings estimator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig, client: Arc<dyn InferenceClient>) -> Result<Self, EngineError> {
        Self::builder(config, client).build()
    }

    pub fn builder(config: EngineConfig, client: Arc<dyn InferenceClient>) -> EngineBuilder {
        EngineBuilder { config, client, sink: None, templates: None, estimator: None }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Queue one request. May cut a batch before returning if the type's
    /// backlog reaches its maximum batch size.
    pub fn enqueue(
        &self,
        request_type: RequestType,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<Enqueued, EngineError> {
        self.enqueue_request(InferenceRequest::with_options(request_type, payload, options))
    }

    /// Queue a request built by the caller (its id must be unused)
    pub fn enqueue_request(&self, request: InferenceRequest) -> Result<Enqueued, EngineError> {
        let inner = &self.inner;
        inner.ensure_accepting()?;

        let request_id = request.id;
        let request_type = request.request_type.clone();
        let queue_position = inner.queue.enqueue(request).map_err(|e| {
            inner.note_enqueue_error(&e, 1);
            e
        })?;

        inner.metrics.record_received(1);
        inner.metrics.observe_queue_depth(inner.queue.len());
        inner.drive(&request_type, Trigger::Arrival);

        Ok(Enqueued { request_id, queue_position })
    }

    /// Queue many payloads of one type atomically; either all are queued or none.
    pub fn bulk_enqueue(
        &self,
        request_type: RequestType,
        payloads: Vec<Value>,
        tenant: Option<String>,
        priority: Priority,
    ) -> Result<Vec<RequestId>, EngineError> {
        let inner = &self.inner;
        inner.ensure_accepting()?;

        let requests: Vec<InferenceRequest> = payloads
            .into_iter()
            .map(|payload| {
                let options = EnqueueOptions { priority, tenant: tenant.clone(), subject_id: None };
                InferenceRequest::with_options(request_type.clone(), payload, options)
            })
            .collect();
        let ids: Vec<RequestId> = requests.iter().map(|r| r.id).collect();
        let count = requests.len();

        inner.queue.enqueue_many(requests).map_err(|e| {
            inner.note_enqueue_error(&e, count);
            e
        })?;

        debug!(request_type = %request_type, count, "Bulk enqueue");
        inner.metrics.record_received(count);
        inner.metrics.observe_queue_depth(inner.queue.len());
        inner.drive(&request_type, Trigger::Arrival);

        Ok(ids)
    }

    /// Non-blocking lookup; repeated calls after completion return the same value
    pub fn get_result(&self, id: &RequestId) -> ResultLookup {
        self.inner.queue.lookup(id)
    }

    /// Wait up to `timeout` for a result.
    ///
    /// A timeout leaves the request untouched; it still completes and can be
    /// fetched later.
    pub async fn await_result(&self, id: RequestId, timeout: Duration) -> Result<InferenceResult, EngineError> {
        let queue = &self.inner.queue;
        wait_for_result(id, timeout, self.inner.config.poll_interval, |id| queue.lookup(id)).await
    }

    /// Cancel a request that has not yet been cut into a batch
    pub fn cancel(&self, id: &RequestId) -> Result<(), EngineError> {
        let result = self.inner.queue.cancel(id)?;
        self.inner.metrics.record_cancelled();
        prom::record_requests(result.request_type.as_str(), ResultStatus::Cancelled.as_str(), 1);
        prom::set_queue_depth(
            result.request_type.as_str(),
            self.inner.queue.backlog(&result.request_type).len,
        );
        info!(request_id = %id, request_type = %result.request_type, "Request cancelled");
        Ok(())
    }

    /// Queue contents plus an estimate of how long it takes to drain
    pub fn get_queue_stats(&self) -> QueueStats {
        let config = &self.inner.config;
        let mut stats = self.inner.queue.stats();

        let batches: usize = stats
            .by_type
            .iter()
            .map(|(name, count)| {
                let max = config.batch_config_for(&RequestType::new(name.as_str())).max_batch_size;
                count.div_ceil(max.max(1))
            })
            .sum();
        let waves = batches.div_ceil(config.max_parallel_batches.max(1));
        let per_batch = self
            .inner
            .metrics
            .avg_batch_duration()
            .unwrap_or(config.batch_latency_estimate);

        stats.estimated_drain_ms = per_batch.as_millis() as u64 * waves as u64;
        stats
    }

    /// Cut every non-empty type's backlog now, regardless of thresholds, and
    /// wait for the resulting batches.
    pub async fn flush_all(&self) -> Vec<BatchResult> {
        let inner = &self.inner;
        let mut handles = Vec::new();
        for request_type in inner.queue.pending_types() {
            handles.extend(inner.drive(&request_type, Trigger::Flush));
        }
        if handles.is_empty() {
            return Vec::new();
        }

        info!(batches = handles.len(), "Flushing all queued requests");
        futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(error = %e, "Flushed batch task did not complete");
                    None
                }
            })
            .collect()
    }

    /// Stop accepting work, flush the queue and wait for every in-flight batch.
    ///
    /// Returns the batches flushed during shutdown.
    pub async fn shutdown(&self) -> Vec<BatchResult> {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
        }
        info!(queued = inner.queue.len(), in_flight = self.in_flight_batches(), "Shutting down batch engine");

        let mut flushed = Vec::new();
        loop {
            flushed.extend(self.flush_all().await);
            while inner.active_batches.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(inner.config.poll_interval).await;
            }
            // Enqueues that raced the flag are flushed on the next pass
            if inner.queue.is_empty() {
                break;
            }
        }
        inner.disarm_all();

        info!(flushed_batches = flushed.len(), "Batch engine stopped");
        flushed
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Batches cut but not yet resolved, including those waiting for a permit
    pub fn in_flight_batches(&self) -> usize {
        self.inner.active_batches.load(Ordering::SeqCst)
    }

    /// Forget results that completed more than `older_than` ago
    pub fn purge_results(&self, older_than: Duration) -> usize {
        let purged = self.inner.results.purge(older_than);
        if purged > 0 {
            debug!(purged, "Purged old results");
        }
        purged
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}
