//! Pending request queue, keyed by request id and grouped by request type.
//!
//! Requests stay here until the scheduler claims them into a batch. Claiming
//! and cancelling hand ids over to the [`ResultStore`] while the queue lock
//! is still held, so an id is always exactly one of queued, in flight or
//! resolved. Lock order is queue, then result store.
//!
//! Each type keeps an ordered index next to its id map, so enqueue, claim and
//! cancel are logarithmic and peeking the head of a backlog does not sort.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::scheduler::Backlog;
use crate::error::EngineError;
use crate::results::ResultStore;
use crate::types::{
    InferenceRequest, InferenceResult, Priority, QueueStats, RequestId, RequestType, ResultLookup,
};

/// Dispatch order: highest priority, then oldest, then insertion order
type OrderKey = (Reverse<u32>, Instant, u64);

/// A request waiting in the queue
#[derive(Debug, Clone)]
struct QueuedEntry {
    request: InferenceRequest,
    /// Insertion order, the last tie-breaker after priority and age
    seq: u64,
}

impl QueuedEntry {
    fn order_key(&self) -> OrderKey {
        (Reverse(self.request.priority.weight()), self.request.created_at, self.seq)
    }
}

/// Pending requests of one type, indexed for ordered peeks and age lookups
#[derive(Debug, Default)]
struct TypeBucket {
    entries: HashMap<RequestId, QueuedEntry>,
    order: BTreeMap<OrderKey, RequestId>,
    by_age: BTreeSet<(Instant, u64)>,
    by_priority: BTreeMap<Priority, usize>,
}

impl TypeBucket {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn oldest(&self) -> Option<Instant> {
        self.by_age.first().map(|(created, _)| *created)
    }

    /// Entries that would be dispatched before one with `key`.
    ///
    /// Higher priorities come from the per-priority counts. Within the same
    /// priority an arrival is normally the newest, so the count is used as is;
    /// only a request created before already-queued peers is counted by range.
    fn ahead_of(&self, key: &OrderKey, priority: Priority) -> usize {
        let higher: usize = self
            .by_priority
            .iter()
            .filter(|(p, _)| p.weight() > priority.weight())
            .map(|(_, count)| count)
            .sum();

        let after = self.order.range((Bound::Excluded(key), Bound::Unbounded)).next();
        let same = match after {
            Some(((weight, _, _), _)) if *weight == key.0 => self
                .order
                .range(..key)
                .rev()
                .take_while(|((weight, _, _), _)| *weight == key.0)
                .count(),
            _ => self.by_priority.get(&priority).copied().unwrap_or(0),
        };

        higher + same
    }

    fn insert(&mut self, entry: QueuedEntry) {
        let id = entry.request.id;
        self.order.insert(entry.order_key(), id);
        self.by_age.insert((entry.request.created_at, entry.seq));
        *self.by_priority.entry(entry.request.priority).or_insert(0) += 1;
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &RequestId) -> Option<QueuedEntry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.order_key());
        self.by_age.remove(&(entry.request.created_at, entry.seq));
        if let Some(count) = self.by_priority.get_mut(&entry.request.priority) {
            *count -= 1;
            if *count == 0 {
                self.by_priority.remove(&entry.request.priority);
            }
        }
        Some(entry)
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    by_type: HashMap<RequestType, TypeBucket>,
    index: HashMap<RequestId, RequestType>,
    next_seq: u64,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn remove(&mut self, id: &RequestId) -> Option<InferenceRequest> {
        let request_type = self.index.remove(id)?;
        let bucket = self.by_type.get_mut(&request_type)?;
        let entry = bucket.remove(id);
        if bucket.is_empty() {
            self.by_type.remove(&request_type);
        }
        entry.map(|e| e.request)
    }
}

/// Result of a claim: the requests removed, in the order their ids were given,
/// and the ids that were no longer queued.
#[derive(Debug, Default)]
pub struct Claim {
    pub claimed: Vec<InferenceRequest>,
    pub missing: Vec<RequestId>,
}

impl Claim {
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Queue of requests that have not yet been batched
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    results: Arc<ResultStore>,
    /// Maximum queued requests across all types (0 = unbounded)
    max_total: usize,
}

impl RequestQueue {
    pub fn new(results: Arc<ResultStore>, max_total: usize) -> Self {
        Self { inner: Mutex::new(QueueInner::default()), results, max_total }
    }

    /// Insert a request.
    ///
    /// Returns the number of same-type requests ordered ahead of it.
    pub fn enqueue(&self, request: InferenceRequest) -> Result<usize, EngineError> {
        let mut positions = self.enqueue_many(vec![request])?;
        Ok(positions.pop().unwrap_or_default())
    }

    /// Insert several requests atomically: either all are queued or none is.
    pub fn enqueue_many(&self, requests: Vec<InferenceRequest>) -> Result<Vec<usize>, EngineError> {
        let mut inner = self.inner.lock();

        if self.max_total > 0 && inner.len() + requests.len() > self.max_total {
            return Err(EngineError::QueueFull { max: self.max_total });
        }
        let mut batch_ids = HashSet::with_capacity(requests.len());
        for request in &requests {
            let id = request.id;
            if !batch_ids.insert(id)
                || inner.index.contains_key(&id)
                || self.results.is_in_flight(&id)
                || self.results.is_resolved(&id)
            {
                return Err(EngineError::DuplicateRequest(id));
            }
        }

        let mut positions = Vec::with_capacity(requests.len());
        for request in requests {
            let seq = inner.next_seq;
            inner.next_seq += 1;

            let entry = QueuedEntry { request, seq };
            let key = entry.order_key();
            let id = entry.request.id;
            let priority = entry.request.priority;
            let request_type = entry.request.request_type.clone();

            let bucket = inner.by_type.entry(request_type.clone()).or_default();
            let ahead = bucket.ahead_of(&key, priority);
            bucket.insert(entry);
            inner.index.insert(id, request_type.clone());
            positions.push(ahead);

            debug!(request_id = %id, request_type = %request_type, position = ahead, "Request enqueued");
        }

        Ok(positions)
    }

    /// Up to `limit` requests of one type, highest priority first, then oldest.
    pub fn peek_ordered(&self, request_type: &RequestType, limit: usize) -> Vec<InferenceRequest> {
        let inner = self.inner.lock();
        let Some(bucket) = inner.by_type.get(request_type) else {
            return Vec::new();
        };
        bucket
            .order
            .values()
            .take(limit)
            .filter_map(|id| bucket.entries.get(id))
            .map(|e| e.request.clone())
            .collect()
    }

    /// Remove the given ids and mark them in flight.
    ///
    /// Ids that are no longer queued (cancelled or claimed concurrently) are
    /// reported in `missing` rather than failing the whole claim.
    pub fn claim(&self, ids: &[RequestId]) -> Claim {
        let mut inner = self.inner.lock();
        let mut claim = Claim::default();

        for id in ids {
            match inner.remove(id) {
                Some(request) => claim.claimed.push(request),
                None => claim.missing.push(*id),
            }
        }
        self.results.mark_in_flight(claim.claimed.iter().map(|r| &r.id));

        claim
    }

    /// Cancel a request that has not been claimed into a batch.
    pub fn cancel(&self, id: &RequestId) -> Result<InferenceResult, EngineError> {
        let mut inner = self.inner.lock();

        if let Some(request) = inner.remove(id) {
            let result = InferenceResult::cancelled(&request);
            self.results.insert(result.clone());
            debug!(request_id = %id, "Request cancelled");
            return Ok(result);
        }

        if self.results.is_in_flight(id) {
            Err(EngineError::AlreadyProcessing(*id))
        } else if self.results.is_resolved(id) {
            Err(EngineError::AlreadyResolved(*id))
        } else {
            Err(EngineError::NotFound(*id))
        }
    }

    /// Where a request currently is: queued or in flight (pending), resolved, or unknown
    pub fn lookup(&self, id: &RequestId) -> ResultLookup {
        let inner = self.inner.lock();
        if inner.index.contains_key(id) {
            return ResultLookup::Pending;
        }
        self.results.lookup(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// Size and age of one type's backlog
    pub fn backlog(&self, request_type: &RequestType) -> Backlog {
        let inner = self.inner.lock();
        match inner.by_type.get(request_type) {
            Some(bucket) => Backlog { len: bucket.len(), oldest: bucket.oldest() },
            None => Backlog::default(),
        }
    }

    /// Request types that currently have queued requests
    pub fn pending_types(&self) -> Vec<RequestType> {
        let inner = self.inner.lock();
        let mut types: Vec<RequestType> = inner.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queue contents. Drain time is left for the engine to fill in.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut by_priority = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        let mut oldest: Option<Instant> = None;

        for (request_type, bucket) in &inner.by_type {
            by_type.insert(request_type.to_string(), bucket.len());
            for (priority, count) in &bucket.by_priority {
                *by_priority.entry(*priority).or_insert(0) += count;
            }
            if let Some(created) = bucket.oldest() {
                oldest = Some(oldest.map_or(created, |o| o.min(created)));
            }
        }

        QueueStats {
            total_queued: inner.len(),
            in_flight: self.results.in_flight_count(),
            by_priority,
            by_type,
            oldest_age_ms: oldest.map(|o| o.elapsed().as_millis() as u64),
            estimated_drain_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnqueueOptions, Priority};
    use serde_json::json;

    fn queue() -> RequestQueue {
        RequestQueue::new(Arc::new(ResultStore::new()), 0)
    }

    fn request(request_type: RequestType, priority: Priority, n: u32) -> InferenceRequest {
        InferenceRequest::with_options(
            request_type,
            json!({ "n": n }),
            EnqueueOptions::with_priority(priority),
        )
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicates() {
        let queue = queue();
        let req = request(RequestType::SCREENING, Priority::Normal, 1);

        assert_eq!(queue.enqueue(req.clone()).unwrap(), 0);
        assert_eq!(queue.enqueue(req.clone()), Err(EngineError::DuplicateRequest(req.id)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_peek_orders_by_priority_then_age() {
        let queue = queue();
        let low = request(RequestType::CARE_PLAN, Priority::Low, 1);
        let normal_a = request(RequestType::CARE_PLAN, Priority::Normal, 2);
        let critical = request(RequestType::CARE_PLAN, Priority::Critical, 3);
        let normal_b = request(RequestType::CARE_PLAN, Priority::Normal, 4);
        let other = request(RequestType::SCREENING, Priority::Critical, 5);

        for r in [&low, &normal_a, &critical, &normal_b, &other] {
            queue.enqueue(r.clone()).unwrap();
        }

        let ids: Vec<RequestId> =
            queue.peek_ordered(&RequestType::CARE_PLAN, 10).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![critical.id, normal_a.id, normal_b.id, low.id]);

        // Pure: nothing removed
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.peek_ordered(&RequestType::CARE_PLAN, 2).len(), 2);
    }

    #[tokio::test]
    async fn test_queue_position_reflects_ordering() {
        let queue = queue();
        queue.enqueue(request(RequestType::SCREENING, Priority::Normal, 1)).unwrap();
        queue.enqueue(request(RequestType::SCREENING, Priority::Normal, 2)).unwrap();

        let urgent = queue.enqueue(request(RequestType::SCREENING, Priority::Critical, 3)).unwrap();
        let trailing = queue.enqueue(request(RequestType::SCREENING, Priority::Batch, 4)).unwrap();
        assert_eq!(urgent, 0);
        assert_eq!(trailing, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_of_request_created_before_queued_peers() {
        let queue = queue();
        let older = request(RequestType::SCREENING, Priority::Normal, 1);
        tokio::time::advance(std::time::Duration::from_millis(10)).await;
        let newer = request(RequestType::SCREENING, Priority::Normal, 2);
        let urgent = request(RequestType::SCREENING, Priority::High, 3);

        assert_eq!(queue.enqueue(urgent.clone()).unwrap(), 0);
        assert_eq!(queue.enqueue(newer.clone()).unwrap(), 1);
        // Arrives last but was created first, so it sorts ahead of `newer`
        assert_eq!(queue.enqueue(older.clone()).unwrap(), 1);

        let ids: Vec<RequestId> =
            queue.peek_ordered(&RequestType::SCREENING, 3).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![urgent.id, older.id, newer.id]);
        assert_eq!(queue.backlog(&RequestType::SCREENING).oldest, Some(older.created_at));
    }

    #[tokio::test]
    async fn test_large_backlog_keeps_order_and_positions() {
        let queue = queue();
        let requests: Vec<InferenceRequest> =
            (0..10_000).map(|n| request(RequestType::BILLING_CODES, Priority::Normal, n)).collect();
        let first = requests[0].id;

        let positions = queue.enqueue_many(requests).unwrap();
        assert!(positions.iter().enumerate().all(|(i, p)| *p == i));

        for n in 0..10_000 {
            let position = queue.enqueue(request(RequestType::BILLING_CODES, Priority::Normal, n)).unwrap();
            assert_eq!(position, 10_000 + n as usize);
        }
        assert_eq!(queue.backlog(&RequestType::BILLING_CODES).len, 20_000);

        let head = queue.peek_ordered(&RequestType::BILLING_CODES, 5);
        assert_eq!(head.len(), 5);
        assert_eq!(head[0].id, first);
    }

    #[tokio::test]
    async fn test_bulk_enqueue_rejects_repeated_id() {
        let queue = queue();
        let a = request(RequestType::SCREENING, Priority::Normal, 1);
        let b = request(RequestType::SCREENING, Priority::Normal, 2);

        let result = queue.enqueue_many(vec![a.clone(), b, a.clone()]);
        assert_eq!(result, Err(EngineError::DuplicateRequest(a.id)));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_indexes_follow_claim_and_cancel() {
        let queue = queue();
        let first = request(RequestType::CARE_PLAN, Priority::High, 1);
        tokio::time::advance(std::time::Duration::from_millis(5)).await;
        let second = request(RequestType::CARE_PLAN, Priority::Low, 2);
        tokio::time::advance(std::time::Duration::from_millis(5)).await;
        let third = request(RequestType::CARE_PLAN, Priority::Low, 3);
        for r in [&first, &second, &third] {
            queue.enqueue(r.clone()).unwrap();
        }

        queue.claim(&[first.id]);
        assert_eq!(queue.backlog(&RequestType::CARE_PLAN).oldest, Some(second.created_at));
        assert_eq!(queue.stats().by_priority.get(&Priority::High), None);

        queue.cancel(&second.id).unwrap();
        let backlog = queue.backlog(&RequestType::CARE_PLAN);
        assert_eq!(backlog.len, 1);
        assert_eq!(backlog.oldest, Some(third.created_at));
        assert_eq!(queue.stats().by_priority.get(&Priority::Low), Some(&1));

        queue.claim(&[third.id]);
        assert_eq!(queue.backlog(&RequestType::CARE_PLAN), Backlog::default());
        assert!(queue.pending_types().is_empty());
    }

    #[tokio::test]
    async fn test_claim_reports_missing_ids() {
        let results = Arc::new(ResultStore::new());
        let queue = RequestQueue::new(results.clone(), 0);
        let a = request(RequestType::BILLING_CODES, Priority::Normal, 1);
        let b = request(RequestType::BILLING_CODES, Priority::Normal, 2);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        queue.cancel(&b.id).unwrap();

        let claim = queue.claim(&[a.id, b.id]);
        assert!(claim.is_partial());
        assert_eq!(claim.claimed.len(), 1);
        assert_eq!(claim.missing, vec![b.id]);

        // Claimed ids are in flight and no longer queued
        assert!(!queue.contains(&a.id));
        assert!(results.is_in_flight(&a.id));
        assert_eq!(queue.lookup(&a.id), ResultLookup::Pending);
    }

    #[tokio::test]
    async fn test_cancel_states() {
        let queue = queue();
        let queued = request(RequestType::SCREENING, Priority::Normal, 1);
        let claimed = request(RequestType::SCREENING, Priority::Normal, 2);
        queue.enqueue(queued.clone()).unwrap();
        queue.enqueue(claimed.clone()).unwrap();
        queue.claim(&[claimed.id]);

        let result = queue.cancel(&queued.id).unwrap();
        assert_eq!(result.status, crate::types::ResultStatus::Cancelled);
        assert_eq!(queue.lookup(&queued.id), ResultLookup::Ready(result));

        assert_eq!(queue.cancel(&claimed.id), Err(EngineError::AlreadyProcessing(claimed.id)));
        assert_eq!(queue.cancel(&queued.id), Err(EngineError::AlreadyResolved(queued.id)));

        let unknown = RequestId::from_u128(42);
        assert_eq!(queue.cancel(&unknown), Err(EngineError::NotFound(unknown)));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let queue = RequestQueue::new(Arc::new(ResultStore::new()), 2);
        queue.enqueue(request(RequestType::SCREENING, Priority::Normal, 1)).unwrap();

        let batch = vec![
            request(RequestType::SCREENING, Priority::Normal, 2),
            request(RequestType::SCREENING, Priority::Normal, 3),
        ];
        assert_eq!(queue.enqueue_many(batch), Err(EngineError::QueueFull { max: 2 }));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_breakdown() {
        let queue = queue();
        queue.enqueue(request(RequestType::SCREENING, Priority::High, 1)).unwrap();
        queue.enqueue(request(RequestType::SCREENING, Priority::Normal, 2)).unwrap();
        queue.enqueue(request(RequestType::CARE_PLAN, Priority::High, 3)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total_queued, 3);
        assert_eq!(stats.by_priority.get(&Priority::High), Some(&2));
        assert_eq!(stats.by_type.get("screening"), Some(&2));
        assert!(stats.oldest_age_ms.is_some());

        let backlog = queue.backlog(&RequestType::SCREENING);
        assert_eq!(backlog.len, 2);
        assert!(backlog.oldest.is_some());
        assert_eq!(queue.pending_types(), vec![RequestType::CARE_PLAN, RequestType::SCREENING]);
    }
}
