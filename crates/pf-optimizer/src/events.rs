//! Progress events emitted while a pipeline runs.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use pf_types::ErrorKind;

/// Discriminant for the kind of pipeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEventKind {
    PipelineStarted { pipeline: String, phases: usize },
    PhaseStarted { phase: String },
    /// Phase skipped because a completed checkpoint exists.
    PhaseResumed { phase: String, evidence: f64 },
    /// An optimizer call failed and is about to be retried.
    PhaseRetry {
        call: String,
        attempt: u32,
        error: String,
    },
    CellCompleted {
        phase: String,
        i: usize,
        j: usize,
        evidence: f64,
    },
    HyperGroupCompleted {
        phase: String,
        group: String,
        evidence: f64,
    },
    PhaseCompleted { phase: String, evidence: f64 },
    PhaseFailed {
        phase: String,
        kind: ErrorKind,
        error: String,
    },
    PipelineCompleted { pipeline: String, phases: usize },
}

/// A single timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Optional channel the pipeline reports progress on.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: PipelineEventKind) {
        if let Some(tx) = &self.tx {
            // Best-effort send; a dropped receiver is not an error.
            let _ = tx.try_send(PipelineEvent::new(kind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn sink_forwards_events() {
        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx);
        sink.emit(PipelineEventKind::PhaseStarted {
            phase: "phase_1".into(),
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(
            event.kind,
            PipelineEventKind::PhaseStarted {
                phase: "phase_1".into()
            }
        );
    }

    #[test]
    fn disabled_sink_and_dropped_receiver_are_silent() {
        EventSink::disabled().emit(PipelineEventKind::PhaseStarted { phase: "x".into() });

        let (tx, rx) = unbounded();
        drop(rx);
        EventSink::new(tx).emit(PipelineEventKind::PhaseStarted { phase: "x".into() });
    }
}
