//! Attempt tracking for optimizer calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::boundary::OptimizerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One invocation of the optimizer boundary. Retries produce one attempt
/// each, numbered from zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    /// Call label, e.g. `phase_1`, `grid[2,3]` or `phase_2/hyper_image_sky`.
    pub call: String,
    pub attempt: u32,
    pub settings: OptimizerSettings,
    pub status: AttemptStatus,
    pub evidence: Option<f64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(call: impl Into<String>, attempt: u32, settings: OptimizerSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            call: call.into(),
            attempt,
            settings,
            status: AttemptStatus::Pending,
            evidence: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = AttemptStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, evidence: f64) {
        self.status = AttemptStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.evidence = Some(evidence);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = AttemptStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Wall time in milliseconds once the attempt has finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
