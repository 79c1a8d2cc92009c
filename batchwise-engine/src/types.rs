//! Data model shared by the queue, scheduler, executor and result store.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

/// Process-unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an id from a fixed value (useful for deterministic tests)
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Identifier of one executed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Category of inference work.
///
/// The type selects the batching policy and the prompt template. It is an
/// open set: the associated constants name the categories shipped with
/// default configuration, and any other string is accepted and served with
/// the engine-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestType(Cow<'static, str>);

impl RequestType {
    pub const RISK_SCORING: RequestType = RequestType(Cow::Borrowed("risk_scoring"));
    pub const BILLING_CODES: RequestType = RequestType(Cow::Borrowed("billing_codes"));
    pub const SDOH_DETECTION: RequestType = RequestType(Cow::Borrowed("sdoh_detection"));
    pub const CARE_PLAN: RequestType = RequestType(Cow::Borrowed("care_plan"));
    pub const SCREENING: RequestType = RequestType(Cow::Borrowed("screening"));
    pub const READMISSION_RISK: RequestType = RequestType(Cow::Borrowed("readmission_risk"));
    pub const MEDICATION_REVIEW: RequestType = RequestType(Cow::Borrowed("medication_review"));
    pub const CLINICAL_SUMMARY: RequestType = RequestType(Cow::Borrowed("clinical_summary"));

    /// Create a request type from any name
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All categories that ship with a template and batching defaults
    pub fn builtin() -> [RequestType; 8] {
        [
            Self::RISK_SCORING,
            Self::BILLING_CODES,
            Self::SDOH_DETECTION,
            Self::CARE_PLAN,
            Self::SCREENING,
            Self::READMISSION_RISK,
            Self::MEDICATION_REVIEW,
            Self::CLINICAL_SUMMARY,
        ]
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Request priority, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Batch,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric ordering weight (higher is served first)
    pub fn weight(self) -> u32 {
        match self {
            Priority::Critical => 100,
            Priority::High => 75,
            Priority::Normal => 50,
            Priority::Low => 25,
            Priority::Batch => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Batch => "batch",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "batch" => Ok(Priority::Batch),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Caller-supplied options for an enqueue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub tenant: Option<String>,
    pub subject_id: Option<String>,
}

impl EnqueueOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self { priority, ..Default::default() }
    }
}

/// One unit of inference work
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub id: RequestId,
    pub request_type: RequestType,
    pub priority: Priority,
    /// Opaque, type-specific payload passed through to the collaborator
    pub payload: Value,
    pub tenant: Option<String>,
    pub subject_id: Option<String>,
    /// Monotonic creation time, used for ordering and wait windows
    pub created_at: Instant,
    /// Wall-clock creation time, for audit
    pub submitted_at: DateTime<Utc>,
}

impl InferenceRequest {
    /// Create a new request with a fresh id and default options
    pub fn new(request_type: RequestType, payload: Value) -> Self {
        Self::with_options(request_type, payload, EnqueueOptions::default())
    }

    pub fn with_options(request_type: RequestType, payload: Value, options: EnqueueOptions) -> Self {
        Self {
            id: RequestId::new(),
            request_type,
            priority: options.priority,
            payload,
            tenant: options.tenant,
            subject_id: options.subject_id,
            created_at: Instant::now(),
            submitted_at: Utc::now(),
        }
    }

    /// Time since the request was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Terminal status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
    Cancelled,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
            ResultStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a request inside a batch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The collaborator call itself failed
    BatchExecutionError,
    /// The combined response could not be split into per-request entries
    BatchParseError,
    /// The combined response ended before this request's entry
    MissingInBatchResponse,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::BatchExecutionError => "BatchExecutionError",
            FailureKind::BatchParseError => "BatchParseError",
            FailureKind::MissingInBatchResponse => "MissingInBatchResponse",
        };
        f.write_str(name)
    }
}

/// Failure detail carried by a failed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Terminal outcome of one request. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub request_id: RequestId,
    pub request_type: RequestType,
    pub status: ResultStatus,
    pub result: Option<Value>,
    pub error: Option<ExecutionFailure>,
    pub cost: f64,
    pub model_used: Option<String>,
    pub from_cache: bool,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
    pub batch_id: Option<BatchId>,
}

impl InferenceResult {
    /// Successful outcome for a request demultiplexed from a batch response
    pub fn completed(
        request: &InferenceRequest,
        batch_id: BatchId,
        value: Value,
        cost: f64,
        model: &str,
        from_cache: bool,
    ) -> Self {
        Self {
            request_id: request.id,
            request_type: request.request_type.clone(),
            status: ResultStatus::Completed,
            result: Some(value),
            error: None,
            cost,
            model_used: Some(model.to_string()),
            from_cache,
            processing_time_ms: request.age().as_millis() as u64,
            completed_at: Utc::now(),
            batch_id: Some(batch_id),
        }
    }

    /// Failed outcome; failed requests never carry cost
    pub fn failed(
        request: &InferenceRequest,
        batch_id: BatchId,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request.id,
            request_type: request.request_type.clone(),
            status: ResultStatus::Failed,
            result: None,
            error: Some(ExecutionFailure { kind, message: message.into() }),
            cost: 0.0,
            model_used: None,
            from_cache: false,
            processing_time_ms: request.age().as_millis() as u64,
            completed_at: Utc::now(),
            batch_id: Some(batch_id),
        }
    }

    /// Outcome written when a queued request is cancelled before batching
    pub fn cancelled(request: &InferenceRequest) -> Self {
        Self {
            request_id: request.id,
            request_type: request.request_type.clone(),
            status: ResultStatus::Cancelled,
            result: None,
            error: None,
            cost: 0.0,
            model_used: None,
            from_cache: false,
            processing_time_ms: request.age().as_millis() as u64,
            completed_at: Utc::now(),
            batch_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Completed
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Summary of one executed batch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub request_type: RequestType,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_cost: f64,
    pub total_savings: f64,
    pub model_used: Option<String>,
    pub processing_time_ms: u64,
    pub results: Vec<InferenceResult>,
}

impl BatchResult {
    pub fn size(&self) -> usize {
        self.results.len()
    }
}

/// Outcome of a non-blocking result lookup
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    /// The request has a terminal result
    Ready(InferenceResult),
    /// The request is queued or in an executing batch
    Pending,
    /// The id was never enqueued or its result has been purged
    NotFound,
}

impl ResultLookup {
    pub fn is_pending(&self) -> bool {
        matches!(self, ResultLookup::Pending)
    }

    pub fn into_result(self) -> Option<InferenceResult> {
        match self {
            ResultLookup::Ready(result) => Some(result),
            _ => None,
        }
    }
}

/// Acknowledgement returned by enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub request_id: RequestId,
    /// Same-type requests ordered ahead of this one at insertion time
    pub queue_position: usize,
}

/// Point-in-time view of the queue, recomputed on demand
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_queued: usize,
    pub in_flight: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub oldest_age_ms: Option<u64>,
    pub estimated_drain_ms: u64,
}
