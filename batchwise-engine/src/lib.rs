//! Batchwise engine library
//!
//! Groups independent inference requests of the same type into batches and
//! executes each batch as a single call to an external inference service,
//! trading a bounded amount of latency for fewer, cheaper calls.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use batchwise_engine::{BatchEngine, EngineConfig, EnqueueOptions, RequestType, SimulatedClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), batchwise_engine::EngineError> {
//!     let engine = BatchEngine::new(EngineConfig::default(), Arc::new(SimulatedClient::new()))?;
//!
//!     let ack = engine.enqueue(
//!         RequestType::BILLING_CODES,
//!         json!({ "note": "Follow-up visit for type 2 diabetes" }),
//!         EnqueueOptions::default(),
//!     )?;
//!     let result = engine.await_result(ack.request_id, Duration::from_secs(10)).await?;
//!     println!("{:?}", result.result);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod client;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod results;
pub mod savings;
pub mod sink;
pub mod templates;
pub mod types;

pub use batcher::{BatchConfig, EngineConfig, MetricsSnapshot};
pub use client::{HttpInferenceClient, InferenceCall, InferenceClient, InferenceResponse, SimulatedClient, SimulatedReply};
pub use engine::{BatchEngine, EngineBuilder};
pub use error::{ClientError, ConfigError, EngineError, SinkError};
pub use savings::{FixedMultiplier, PerRequestBaseline, SavingsEstimator};
pub use sink::{BatchRecord, HttpMetricsSink, MemorySink, MetricsSink, NoopSink, TracingSink};
pub use templates::{PromptTemplate, TemplateRegistry};
pub use types::{
    BatchId, BatchResult, EnqueueOptions, Enqueued, ExecutionFailure, FailureKind, InferenceRequest,
    InferenceResult, Priority, QueueStats, RequestId, RequestType, ResultLookup, ResultStatus,
};
