//! The optimizer boundary and the policy wrapped around every call to it.
//!
//! The pipeline treats the optimizer as an opaque async function
//! `(model, data, settings) -> FitResult`. [`CallContext::fit`] adds the
//! per-phase deadline, the retry policy with relaxed settings, result
//! validation and cancellation on top of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use pf_data::Dataset;
use pf_types::{FitResult, Model, OptimizationError, PfError, PfResult};

use crate::events::{EventSink, PipelineEventKind};
use crate::trial::Attempt;

/// An external optimizer / sampler.
#[async_trait]
pub trait Optimizer: Send + Sync {
    /// Fit `model` to `data`. `settings` are forwarded untouched from the
    /// phase configuration.
    async fn fit(
        &self,
        model: &Model,
        data: &Dataset,
        settings: &OptimizerSettings,
    ) -> Result<FitResult, OptimizationError>;

    /// Human-readable optimizer name.
    fn name(&self) -> &str;
}

/// Opaque optimizer configuration: a method name plus free-form options
/// (e.g. `n_live_points`, `sampling_efficiency`, `const_efficiency_mode`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub method: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl OptimizerSettings {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Copy with each numeric option in `keys` scaled by `factor`. Integer
    /// options stay integers and never drop below one.
    pub fn relaxed(&self, keys: &[String], factor: f64) -> Self {
        let mut out = self.clone();
        for key in keys {
            let Some(value) = out.options.get_mut(key) else {
                continue;
            };
            if let Some(n) = value.as_u64() {
                let scaled = ((n as f64) * factor).round().max(1.0) as u64;
                *value = serde_json::Value::from(scaled);
            } else if let Some(x) = value.as_f64() {
                *value = serde_json::Value::from(x * factor);
            }
        }
        out
    }
}

/// What to do when an optimizer call fails or times out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first; zero aborts on the first failure.
    pub max_retries: u32,
    /// Multiplier applied to every `relax_keys` option on each retry.
    pub relax_factor: f64,
    pub relax_keys: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            relax_factor: 0.5,
            relax_keys: vec!["n_live_points".to_string()],
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Deadline plus retry policy for one phase's optimizer calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallPolicy {
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

/// Receiving half of a pipeline cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Sending half; dropping it never cancels.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked cancellation handle and token.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, token) = cancel_pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A successful call together with every attempt it took.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub result: FitResult,
    pub attempts: Vec<Attempt>,
}

/// Everything an optimizer call needs. Cheap to clone into worker tasks.
#[derive(Clone)]
pub struct CallContext {
    pub optimizer: Arc<dyn Optimizer>,
    pub data: Dataset,
    pub policy: CallPolicy,
    pub cancel: CancelToken,
    pub events: EventSink,
}

impl CallContext {
    pub fn new(optimizer: Arc<dyn Optimizer>, data: Dataset) -> Self {
        Self {
            optimizer,
            data,
            policy: CallPolicy::default(),
            cancel: CancelToken::never(),
            events: EventSink::disabled(),
        }
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run the optimizer on `model`, applying timeout, validation and the
    /// retry policy. Invalid results are never returned.
    pub async fn fit(
        &self,
        call: &str,
        model: &Model,
        settings: &OptimizerSettings,
    ) -> PfResult<CallOutcome> {
        let retry = &self.policy.retry;
        let mut cancel = self.cancel.clone();
        let mut settings = settings.clone();
        let mut attempts = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(PfError::Cancelled);
            }

            let mut record = Attempt::new(call, attempt, settings.clone());
            record.mark_running();
            debug!(call = %call, attempt, optimizer = %self.optimizer.name(), "optimizer call");

            let outcome = tokio::select! {
                outcome = self.call_once(model, &settings) => outcome,
                _ = cancel.cancelled() => {
                    record.mark_failed("cancelled".to_string());
                    return Err(PfError::Cancelled);
                }
            };

            match outcome {
                Ok(result) => {
                    record.mark_completed(result.evidence);
                    attempts.push(record);
                    return Ok(CallOutcome { result, attempts });
                }
                Err(err) => {
                    record.mark_failed(err.to_string());
                    attempts.push(record);
                    let err = PfError::from(err);
                    if !err.is_retryable() || attempt >= retry.max_retries {
                        return Err(err);
                    }

                    attempt += 1;
                    warn!(
                        call = %call,
                        attempt,
                        max_retries = retry.max_retries,
                        error = %err,
                        "optimizer call failed, retrying with relaxed settings"
                    );
                    self.events.emit(PipelineEventKind::PhaseRetry {
                        call: call.to_string(),
                        attempt,
                        error: err.to_string(),
                    });
                    settings = settings.relaxed(&retry.relax_keys, retry.relax_factor);
                }
            }
        }
    }

    async fn call_once(
        &self,
        model: &Model,
        settings: &OptimizerSettings,
    ) -> Result<FitResult, OptimizationError> {
        let call = self.optimizer.fit(model, &self.data, settings);
        let result = match self.policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(OptimizationError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => call.await,
        }?;
        result.validate()?;
        Ok(result)
    }
}
