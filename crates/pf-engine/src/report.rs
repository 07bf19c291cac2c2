// Per-run bookkeeping returned by the pipeline and written next to its checkpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use pf_optimizer::Attempt;
use pf_types::ErrorKind;

pub const REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseStatus {
    Completed,
    /// Loaded from a completed checkpoint instead of re-running.
    Resumed,
    Failed,
}

/// What happened to one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    pub status: PhaseStatus,
    pub evidence: Option<f64>,
    pub hyper_evidence: Option<f64>,
    pub attempts: Vec<Attempt>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PhaseRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pipeline: String,
    pub output_dir: PathBuf,
    pub phases: Vec<PhaseRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(pipeline: impl Into<String>, output_dir: PathBuf) -> Self {
        Self {
            pipeline: pipeline.into(),
            output_dir,
            phases: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|r| r.phase == name)
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.iter().filter(|r| r.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.finished_at.is_some() && self.count(PhaseStatus::Failed) == 0
    }

    pub fn total_attempts(&self) -> usize {
        self.phases.iter().map(|r| r.attempts.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(phase: &str, status: PhaseStatus, attempts: usize) -> PhaseRecord {
        let now = Utc::now();
        PhaseRecord {
            phase: phase.into(),
            status,
            evidence: Some(-1.0),
            hyper_evidence: None,
            attempts: (0..attempts)
                .map(|i| Attempt::new(phase, i as u32, Default::default()))
                .collect(),
            error_kind: None,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_report_counts() {
        let mut report = RunReport::new("lens_sie", PathBuf::from("/tmp/out"));
        report.phases.push(record("phase_1", PhaseStatus::Resumed, 0));
        report.phases.push(record("phase_2", PhaseStatus::Completed, 2));
        assert!(!report.is_success());

        report.finished_at = Some(Utc::now());
        assert!(report.is_success());
        assert_eq!(report.count(PhaseStatus::Resumed), 1);
        assert_eq!(report.total_attempts(), 2);
        assert_eq!(report.phase("phase_2").unwrap().duration_ms(), 0);

        report.phases.push(record("phase_3", PhaseStatus::Failed, 1));
        assert!(!report.is_success());
        assert!(report.phase("phase_4").is_none());
    }
}
