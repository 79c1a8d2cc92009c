//! Result store and waiter.
//!
//! The store holds terminal outcomes keyed by request id, together with the
//! set of ids that are claimed into executing batches. A batch publishes all
//! of its results under one lock acquisition, so readers never observe a
//! partially written batch, and an id leaves the in-flight set in the same
//! step its result becomes visible.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::EngineError;
use crate::types::{InferenceResult, RequestId, ResultLookup};

#[derive(Debug, Default)]
struct StoreInner {
    results: HashMap<RequestId, InferenceResult>,
    in_flight: HashSet<RequestId>,
}

/// Process-lifetime store of request outcomes
#[derive(Debug, Default)]
pub struct ResultStore {
    inner: Mutex<StoreInner>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record ids as claimed into an executing batch
    pub fn mark_in_flight<'a>(&self, ids: impl IntoIterator<Item = &'a RequestId>) {
        let mut inner = self.inner.lock();
        inner.in_flight.extend(ids.into_iter().copied());
    }

    /// Publish every result of a batch in one step
    pub fn publish_batch(&self, results: &[InferenceResult]) {
        let mut inner = self.inner.lock();
        for result in results {
            inner.in_flight.remove(&result.request_id);
            inner.results.insert(result.request_id, result.clone());
        }
        debug!(count = results.len(), "Batch results published");
    }

    /// Store the outcome of a request that never reached a batch
    pub fn insert(&self, result: InferenceResult) {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(&result.request_id);
        inner.results.insert(result.request_id, result);
    }

    pub fn get(&self, id: &RequestId) -> Option<InferenceResult> {
        self.inner.lock().results.get(id).cloned()
    }

    /// Lookup that distinguishes in-flight ids from unknown ones.
    ///
    /// Ids that are still queued are not known to the store; callers check
    /// the queue first.
    pub fn lookup(&self, id: &RequestId) -> ResultLookup {
        let inner = self.inner.lock();
        if let Some(result) = inner.results.get(id) {
            ResultLookup::Ready(result.clone())
        } else if inner.in_flight.contains(id) {
            ResultLookup::Pending
        } else {
            ResultLookup::NotFound
        }
    }

    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.inner.lock().in_flight.contains(id)
    }

    pub fn is_resolved(&self, id: &RequestId) -> bool {
        self.inner.lock().results.contains_key(id)
    }

    /// Number of ids claimed into executing batches
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.inner.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop results that completed more than `older_than` ago.
    ///
    /// Purged ids report `NotFound` afterwards.
    pub fn purge(&self, older_than: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(older_than) {
            Ok(age) => Utc::now() - age,
            Err(_) => return 0,
        };
        let mut inner = self.inner.lock();
        let before = inner.results.len();
        inner.results.retain(|_, result| result.completed_at > cutoff);
        before - inner.results.len()
    }
}

/// Poll `lookup` until it yields a result or `timeout` elapses.
///
/// Timing out does not affect the underlying request; a later lookup can
/// still retrieve its result.
pub async fn wait_for_result<F>(
    id: RequestId,
    timeout: Duration,
    poll_interval: Duration,
    lookup: F,
) -> Result<InferenceResult, EngineError>
where
    F: Fn(&RequestId) -> ResultLookup,
{
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        match lookup(&id) {
            ResultLookup::Ready(result) => return Ok(result),
            ResultLookup::NotFound => return Err(EngineError::NotFound(id)),
            ResultLookup::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(EngineError::Timeout { id, waited: now - started });
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
