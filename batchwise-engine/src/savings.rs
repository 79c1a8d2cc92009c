//! Estimates of what a batch would have cost as individual calls.
//!
//! The default is a fixed multiplier over the observed batch cost. It is an
//! approximation, so the estimator is a trait and can be replaced, for
//! example with per-type baselines measured from unbatched traffic.

use std::collections::HashMap;

use crate::types::RequestType;

/// Estimate of unbatched cost for one executed batch
pub trait SavingsEstimator: Send + Sync {
    /// Cost the batch's requests would have incurred one by one
    fn individual_cost(&self, request_type: &RequestType, batch_size: usize, batch_cost: f64) -> f64;

    /// `individual_cost - batch_cost`, never negative
    fn savings(&self, request_type: &RequestType, batch_size: usize, batch_cost: f64) -> f64 {
        (self.individual_cost(request_type, batch_size, batch_cost) - batch_cost).max(0.0)
    }
}

/// `batch_cost * multiplier`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedMultiplier(pub f64);

impl Default for FixedMultiplier {
    fn default() -> Self {
        Self(2.5)
    }
}

impl SavingsEstimator for FixedMultiplier {
    fn individual_cost(&self, _request_type: &RequestType, batch_size: usize, batch_cost: f64) -> f64 {
        if batch_size == 0 {
            return 0.0;
        }
        batch_cost * self.0
    }
}

/// Known per-request cost for each type, with a multiplier fallback for others
#[derive(Debug, Clone, Default)]
pub struct PerRequestBaseline {
    baselines: HashMap<RequestType, f64>,
    fallback: FixedMultiplier,
}

impl PerRequestBaseline {
    pub fn new(fallback: FixedMultiplier) -> Self {
        Self { baselines: HashMap::new(), fallback }
    }

    /// Set the cost of a single unbatched call for a type
    pub fn with_baseline(mut self, request_type: RequestType, cost_per_request: f64) -> Self {
        self.baselines.insert(request_type, cost_per_request);
        self
    }
}

impl SavingsEstimator for PerRequestBaseline {
    fn individual_cost(&self, request_type: &RequestType, batch_size: usize, batch_cost: f64) -> f64 {
        match self.baselines.get(request_type) {
            Some(per_request) => per_request * batch_size as f64,
            None => self.fallback.individual_cost(request_type, batch_size, batch_cost),
        }
    }
}
