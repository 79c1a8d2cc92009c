//! Request batching for expensive inference calls.
//!
//! Requests of the same type are held in a queue until their type's batch
//! window closes, then sent to the inference service as one combined call.
//! The single response is split back into one result per request.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Incoming Requests                     │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │  RequestQueue   │ ← Per-type, priority then age
//!                    │  ┌───────────┐  │
//!                    │  │ billing   │  │
//!                    │  │ sdoh      │  │
//!                    │  │ ...       │  │
//!                    │  └───────────┘  │
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │  BatchWindow    │ ← One timer per type
//!                    │ (size / wait)   │
//!                    └────────┬────────┘
//!                             │ claim
//!                    ┌────────▼────────┐
//!                    │   Semaphore     │ ← Concurrency limit
//!                    │ (max_parallel)  │
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │ InferenceClient │ ← One call per batch
//!                    └────────┬────────┘
//!                             │ demux
//!                    ┌────────▼────────┐
//!                    │  ResultStore    │ ← Whole batch published at once
//!                    └─────────────────┘
//! ```
//!
//! # Features
//!
//! - **Size and time triggers**: a full batch is cut at once; otherwise the
//!   window closes after `max_wait`, with a grace period for undersized batches
//! - **Priority ordering**: higher priority first, then oldest first
//! - **Bounded execution**: at most `max_parallel_batches` calls at a time
//! - **Positional demultiplexing**: result `i` always belongs to request `i`
//! - **Metrics**: cost, estimated savings, batch sizes and queue depth

mod config;
mod demux;
mod executor;
mod metrics;
mod queue;
mod scheduler;

pub use config::{BatchConfig, EngineConfig};
pub use demux::{split_response, DemuxError, Demuxed};
pub use executor::{Batch, BatchExecutor};
pub use metrics::{BatchMetrics, MetricsSnapshot};
pub use queue::{Claim, RequestQueue};
pub use scheduler::{Backlog, BatchWindow, Step, Trigger, WindowState};
