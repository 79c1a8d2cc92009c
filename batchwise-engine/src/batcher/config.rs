//! Configuration for batching windows and the engine.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::types::RequestType;

/// Batching policy for one request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchConfig {
    /// A batch is cut as soon as this many requests are queued
    pub max_batch_size: usize,

    /// Below this size an elapsed window gets one grace period before cutting
    pub min_batch_size: usize,

    /// Length of the batch window, measured from the oldest queued request
    #[serde(rename = "max_wait_ms", serialize_with = "serialize_millis")]
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch_size: 10, min_batch_size: 3, max_wait: Duration::from_millis(5000) }
    }
}

impl BatchConfig {
    pub fn new(max_batch_size: usize, min_batch_size: usize, max_wait: Duration) -> Self {
        Self { max_batch_size, min_batch_size, max_wait }
    }

    /// Check the batch invariants: sizes positive, min <= max, window positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::not_positive("max_batch_size"));
        }
        if self.min_batch_size == 0 {
            return Err(ConfigError::not_positive("min_batch_size"));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_batch_size,
                max: self.max_batch_size,
            });
        }
        if self.max_wait.is_zero() {
            return Err(ConfigError::not_positive("max_wait"));
        }
        Ok(())
    }
}

/// Engine-wide configuration. Read-only once the engine is built.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Policy for request types without an override
    pub default_batch: BatchConfig,

    /// Per-type policy overrides
    pub type_overrides: HashMap<RequestType, BatchConfig>,

    /// Maximum number of batches executing at once, across all types
    pub max_parallel_batches: usize,

    /// Maximum requests waiting across all types (0 disables the limit)
    pub max_queue_total: usize,

    /// Extra wait granted to an undersized batch once its window elapses.
    /// Clamped to the type's `max_wait`.
    #[serde(rename = "grace_period_ms", serialize_with = "serialize_millis")]
    pub grace_period: Duration,

    /// Interval at which `await_result` polls the result store
    #[serde(rename = "poll_interval_ms", serialize_with = "serialize_millis")]
    pub poll_interval: Duration,

    /// Multiplier over observed batch cost used to estimate unbatched cost
    pub savings_multiplier: f64,

    /// Assumed batch latency for drain estimates before any batch has run
    #[serde(rename = "batch_latency_estimate_ms", serialize_with = "serialize_millis")]
    pub batch_latency_estimate: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut type_overrides = HashMap::new();
        type_overrides.insert(
            RequestType::BILLING_CODES,
            BatchConfig::new(5, 2, Duration::from_millis(3000)),
        );
        type_overrides.insert(
            RequestType::SDOH_DETECTION,
            BatchConfig::new(5, 2, Duration::from_millis(3000)),
        );
        type_overrides.insert(
            RequestType::RISK_SCORING,
            BatchConfig::new(10, 3, Duration::from_millis(5000)),
        );

        Self {
            default_batch: BatchConfig::default(),
            type_overrides,
            max_parallel_batches: 3,
            max_queue_total: 10_000,
            grace_period: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(100),
            savings_multiplier: 2.5,
            batch_latency_estimate: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Small windows and batches for interactive use
    pub fn low_latency() -> Self {
        Self {
            default_batch: BatchConfig::new(4, 1, Duration::from_millis(500)),
            type_overrides: HashMap::new(),
            max_parallel_batches: 6,
            max_queue_total: 1_000,
            grace_period: Duration::from_millis(100),
            poll_interval: Duration::from_millis(25),
            savings_multiplier: 2.5,
            batch_latency_estimate: Duration::from_secs(1),
        }
    }

    /// Large windows and batches to minimise the number of external calls
    pub fn cost_optimized() -> Self {
        Self {
            default_batch: BatchConfig::new(25, 10, Duration::from_secs(15)),
            type_overrides: HashMap::new(),
            max_parallel_batches: 2,
            max_queue_total: 50_000,
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            savings_multiplier: 2.5,
            batch_latency_estimate: Duration::from_secs(5),
        }
    }

    /// Override the batching policy for one request type
    pub fn with_type_config(mut self, request_type: RequestType, config: BatchConfig) -> Self {
        self.type_overrides.insert(request_type, config);
        self
    }

    /// Effective batching policy for a request type
    pub fn batch_config_for(&self, request_type: &RequestType) -> BatchConfig {
        self.type_overrides.get(request_type).copied().unwrap_or(self.default_batch)
    }

    /// Grace period for a type, never longer than its window
    pub fn grace_period_for(&self, request_type: &RequestType) -> Duration {
        self.grace_period.min(self.batch_config_for(request_type).max_wait)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_batch.validate()?;
        for config in self.type_overrides.values() {
            config.validate()?;
        }
        if self.max_parallel_batches == 0 {
            return Err(ConfigError::not_positive("max_parallel_batches"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::not_positive("poll_interval"));
        }
        if !self.savings_multiplier.is_finite() || self.savings_multiplier < 0.0 {
            return Err(ConfigError::invalid(
                "savings_multiplier",
                format!("{} is not a non-negative number", self.savings_multiplier),
            ));
        }
        Ok(())
    }

    /// Create config from environment variables.
    ///
    /// Unparseable values are ignored and the default is kept. Per-type
    /// overrides are read for the built-in types as
    /// `BATCHWISE_<TYPE>_MAX_BATCH_SIZE`, `..._MIN_BATCH_SIZE` and `..._MAX_WAIT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("BATCHWISE_MAX_BATCH_SIZE") {
            config.default_batch.max_batch_size = n;
        }
        if let Some(n) = env_parse("BATCHWISE_MIN_BATCH_SIZE") {
            config.default_batch.min_batch_size = n;
        }
        if let Some(ms) = env_parse("BATCHWISE_MAX_WAIT_MS") {
            config.default_batch.max_wait = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("BATCHWISE_MAX_PARALLEL_BATCHES") {
            config.max_parallel_batches = n;
        }
        if let Some(n) = env_parse("BATCHWISE_MAX_QUEUE") {
            config.max_queue_total = n;
        }
        if let Some(ms) = env_parse("BATCHWISE_GRACE_PERIOD_MS") {
            config.grace_period = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("BATCHWISE_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(m) = env_parse("BATCHWISE_SAVINGS_MULTIPLIER") {
            config.savings_multiplier = m;
        }

        for request_type in RequestType::builtin() {
            let prefix = format!("BATCHWISE_{}", request_type.as_str().to_uppercase());
            let mut batch = config.batch_config_for(&request_type);
            let mut changed = false;

            if let Some(n) = env_parse(&format!("{}_MAX_BATCH_SIZE", prefix)) {
                batch.max_batch_size = n;
                changed = true;
            }
            if let Some(n) = env_parse(&format!("{}_MIN_BATCH_SIZE", prefix)) {
                batch.min_batch_size = n;
                changed = true;
            }
            if let Some(ms) = env_parse(&format!("{}_MAX_WAIT_MS", prefix)) {
                batch.max_wait = Duration::from_millis(ms);
                changed = true;
            }

            if changed {
                config.type_overrides.insert(request_type, batch);
            }
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel_batches, 3);
        assert_eq!(config.default_batch.max_batch_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_type_overrides() {
        let config = EngineConfig::default();
        let billing = config.batch_config_for(&RequestType::BILLING_CODES);
        assert_eq!(billing.max_batch_size, 5);
        assert_eq!(billing.max_wait, Duration::from_millis(3000));

        let unknown = config.batch_config_for(&RequestType::new("unlisted"));
        assert_eq!(unknown, config.default_batch);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(EngineConfig::low_latency().validate().is_ok());
        assert!(EngineConfig::cost_optimized().validate().is_ok());
        assert_eq!(EngineConfig::low_latency().default_batch.min_batch_size, 1);
    }

    #[test]
    fn test_batch_config_validation() {
        assert!(BatchConfig::new(5, 2, Duration::from_millis(10)).validate().is_ok());
        assert_eq!(
            BatchConfig::new(0, 1, Duration::from_millis(10)).validate(),
            Err(ConfigError::not_positive("max_batch_size"))
        );
        assert_eq!(
            BatchConfig::new(3, 4, Duration::from_millis(10)).validate(),
            Err(ConfigError::MinExceedsMax { min: 4, max: 3 })
        );
        assert!(BatchConfig::new(3, 1, Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_engine_validation_rejects_bad_override() {
        let config = EngineConfig::default()
            .with_type_config(RequestType::CARE_PLAN, BatchConfig::new(2, 5, Duration::from_secs(1)));
        assert!(matches!(config.validate(), Err(ConfigError::MinExceedsMax { .. })));

        let config = EngineConfig { max_parallel_batches: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::not_positive("max_parallel_batches")));
    }

    #[test]
    fn test_grace_period_clamped_to_window() {
        let config = EngineConfig { grace_period: Duration::from_secs(60), ..Default::default() }
            .with_type_config(RequestType::SCREENING, BatchConfig::new(4, 2, Duration::from_secs(2)));
        assert_eq!(config.grace_period_for(&RequestType::SCREENING), Duration::from_secs(2));
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let value = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(value["grace_period_ms"], 1000);
        assert_eq!(value["default_batch"]["max_wait_ms"], 5000);
        assert_eq!(value["type_overrides"]["billing_codes"]["max_batch_size"], 5);
    }
}
