// phasefit pipeline engine
// Runs ordered optimization phases, linking each phase's priors to earlier results

pub mod collection;
pub mod config;
pub mod hyper;
pub mod phase;
pub mod pipeline;
pub mod report;

pub use collection::ResultsCollection;
pub use config::{RunConfig, OUTPUT_ROOT_ENV};
pub use hyper::{HyperExtender, HyperGroup, HyperOutcome, HyperSettings};
pub use phase::{DeriveFn, LinkPlan, Phase, PhaseKind};
pub use pipeline::{Pipeline, PipelineOutcome, Stage, GRID_FILE};
pub use report::{PhaseRecord, PhaseStatus, RunReport, REPORT_FILE};
