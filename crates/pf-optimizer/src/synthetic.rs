//! Deterministic in-process optimizer.
//!
//! Fits every free parameter straight to a configured target value and
//! scores the fit as minus the squared distance to all targets. Used to
//! drive the pipeline without an external sampler, and in tests to script
//! failures and latency.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

use pf_data::Dataset;
use pf_types::{FitResult, Model, OptimizationError, ParamPath, Prior, PriorShape};

use crate::boundary::{Optimizer, OptimizerSettings};

/// Reference optimizer with a known optimum.
#[derive(Debug)]
pub struct SyntheticOptimizer {
    targets: BTreeMap<ParamPath, f64>,
    /// Value scored for a target whose parameter is not in the model.
    default_value: f64,
    posterior_sigma: f64,
    latency: Option<Duration>,
    fail_next: AtomicU32,
    failing_component: Option<String>,
    calls: Mutex<Vec<Model>>,
}

impl Default for SyntheticOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticOptimizer {
    pub fn new() -> Self {
        Self {
            targets: BTreeMap::new(),
            default_value: 0.0,
            posterior_sigma: 0.05,
            latency: None,
            fail_next: AtomicU32::new(0),
            failing_component: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_target(mut self, path: ParamPath, value: f64) -> Self {
        self.targets.insert(path, value);
        self
    }

    pub fn with_default_value(mut self, value: f64) -> Self {
        self.default_value = value;
        self
    }

    pub fn with_posterior_sigma(mut self, sigma: f64) -> Self {
        self.posterior_sigma = sigma;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` calls.
    pub fn with_failures(self, count: u32) -> Self {
        self.fail_next.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every call whose model contains `component`.
    pub fn failing_for_component(mut self, component: impl Into<String>) -> Self {
        self.failing_component = Some(component.into());
        self
    }

    /// Schedule `count` more failures on an optimizer that is already shared.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Models received so far, in call order.
    pub fn calls(&self) -> Vec<Model> {
        self.calls.lock().clone()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn best_value(&self, path: &ParamPath, prior: &Prior) -> f64 {
        if let Some(value) = prior.fixed_value() {
            return value;
        }
        let Some(&target) = self.targets.get(path) else {
            return prior.centre();
        };
        let target = match prior.shape {
            PriorShape::Uniform { lower, upper } => target.max(lower).min(upper),
            _ => target,
        };
        match prior.domain {
            Some(domain) => domain.clamp(target),
            None => target,
        }
    }

    fn evidence(&self, constant: &Model) -> f64 {
        -self
            .targets
            .iter()
            .map(|(path, target)| {
                let value = constant
                    .prior(path)
                    .and_then(Prior::fixed_value)
                    .unwrap_or(self.default_value);
                (value - target).powi(2)
            })
            .sum::<f64>()
    }
}

#[async_trait]
impl Optimizer for SyntheticOptimizer {
    async fn fit(
        &self,
        model: &Model,
        _data: &Dataset,
        settings: &OptimizerSettings,
    ) -> Result<FitResult, OptimizationError> {
        self.calls.lock().push(model.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.take_failure() {
            return Err(OptimizationError::failed("synthetic failure"));
        }
        if let Some(component) = &self.failing_component {
            if model.component(component).is_some() {
                return Err(OptimizationError::failed(format!(
                    "synthetic failure for component {component}"
                )));
            }
        }

        let constant = model.fixed_at(|path, prior| self.best_value(path, prior));
        let mut variable = constant.clone();
        for (path, prior) in model.iter() {
            if prior.is_fixed() {
                continue;
            }
            let best = self.best_value(&path, prior);
            let posterior = Prior::gaussian(best, self.posterior_sigma).with_optional_domain(prior.domain);
            variable
                .set_prior(&path, posterior)
                .map_err(|e| OptimizationError::failed(e.to_string()))?;
        }
        let evidence = self.evidence(&constant);

        debug!(
            method = %settings.method,
            free = model.free_parameter_count(),
            evidence,
            "synthetic fit"
        );
        Ok(FitResult::new(constant, variable, evidence))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
