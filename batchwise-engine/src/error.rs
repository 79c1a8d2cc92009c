//! Error types for the batchwise engine.
//!
//! Errors are split by who observes them:
//!
//! ```text
//! EngineError  - caller errors, returned synchronously from the engine API
//! ConfigError  - invalid batch or engine configuration
//! ClientError  - failures of the inference collaborator (caught by the executor)
//! SinkError    - metrics persistence failures (logged and swallowed)
//! ```
//!
//! Execution failures of a batch are never returned as `Err` to callers. They
//! are recorded per request as a [`FailureKind`](crate::types::FailureKind)
//! inside the request's `InferenceResult`.

use std::time::Duration;

use thiserror::Error;

use crate::types::RequestId;

/// Errors returned by the caller-facing engine API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A request with this id is already known to the engine
    #[error("Request {0} is already queued")]
    DuplicateRequest(RequestId),

    /// The id was never enqueued, or its result has been purged
    #[error("Request {0} not found")]
    NotFound(RequestId),

    /// The request has been claimed into a batch and can no longer be cancelled
    #[error("Request {0} is already part of an executing batch")]
    AlreadyProcessing(RequestId),

    /// The request already has a terminal result
    #[error("Request {0} has already been resolved")]
    AlreadyResolved(RequestId),

    /// The caller stopped waiting; the request may still complete later
    #[error("Timed out after {waited:?} waiting for request {id}")]
    Timeout { id: RequestId, waited: Duration },

    /// The queue has reached its configured capacity
    #[error("Queue is full (max: {max})")]
    QueueFull { max: usize },

    /// The engine is shutting down and no longer accepts work
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// The engine was constructed outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration failed validation
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl EngineError {
    /// True for errors that describe a caller mistake or race rather than a
    /// condition of the engine itself.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicateRequest(_)
                | EngineError::NotFound(_)
                | EngineError::AlreadyProcessing(_)
                | EngineError::AlreadyResolved(_)
        )
    }
}

/// Errors raised while validating configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("min_batch_size ({min}) must not exceed max_batch_size ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    /// Create a zero/negative value error
    pub fn not_positive(field: &'static str) -> Self {
        Self::NotPositive { field }
    }

    /// Create a generic invalid value error
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Errors raised by an inference collaborator
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the inference service
    #[error("Failed to reach inference service: {0}")]
    Transport(String),

    /// The service answered with an error status
    #[error("Inference service returned {status}: {message}")]
    Service { status: u16, message: String },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client implementation panicked during the call
    #[error("Inference client panicked: {0}")]
    Panicked(String),
}

impl ClientError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a service error
    pub fn service(status: u16, msg: impl Into<String>) -> Self {
        Self::Service { status, message: msg.into() }
    }
}

/// Errors raised by a metrics sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Metrics sink unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metrics sink rejected record with status {0}")]
    Rejected(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let id = RequestId::from_u128(7);
        let err = EngineError::AlreadyProcessing(id);
        assert!(err.to_string().contains("already part of an executing batch"));

        let err = EngineError::Timeout { id, waited: Duration::from_millis(250) };
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_caller_error_classification() {
        let id = RequestId::from_u128(1);
        assert!(EngineError::DuplicateRequest(id).is_caller_error());
        assert!(EngineError::AlreadyProcessing(id).is_caller_error());
        assert!(!EngineError::Timeout { id, waited: Duration::ZERO }.is_caller_error());
        assert!(!EngineError::ShuttingDown.is_caller_error());
    }

    #[test]
    fn test_config_error_helpers() {
        let err = ConfigError::not_positive("max_batch_size");
        assert_eq!(err.to_string(), "max_batch_size must be greater than zero");

        let err = ConfigError::MinExceedsMax { min: 6, max: 5 };
        assert_eq!(err.to_string(), "min_batch_size (6) must not exceed max_batch_size (5)");

        let engine_err: EngineError = ConfigError::invalid("grace_period", "too long").into();
        assert!(matches!(engine_err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_client_error_helpers() {
        let err = ClientError::service(503, "overloaded");
        assert_eq!(err.to_string(), "Inference service returned 503: overloaded");
        assert!(matches!(ClientError::transport("refused"), ClientError::Transport(_)));
    }
}
