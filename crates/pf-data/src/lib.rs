//! Dataset handles and checkpoint storage for phasefit pipelines.

pub mod checkpoint;
pub mod dataset;

pub use checkpoint::*;
pub use dataset::*;
