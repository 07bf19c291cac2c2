//! # pf-optimizer
//!
//! The optimizer boundary of phasefit and everything wrapped around a single
//! call to it: settings, retry and timeout policy, cancellation, attempt
//! tracking and progress events. Also hosts the two-parameter grid search
//! and a deterministic synthetic optimizer.

mod boundary;
mod events;
mod grid;
mod synthetic;
mod trial;

pub use boundary::{
    cancel_pair, CallContext, CallOutcome, CallPolicy, CancelHandle, CancelToken, Optimizer,
    OptimizerSettings, RetryPolicy,
};
pub use events::{EventSink, PipelineEvent, PipelineEventKind};
pub use grid::{Cell, CellResult, GridOutcome, GridResult, GridSearch, GridSpec};
pub use synthetic::SyntheticOptimizer;
pub use trial::{Attempt, AttemptStatus};
