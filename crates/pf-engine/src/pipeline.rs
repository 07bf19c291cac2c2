// Sequential multi-phase pipeline executor

use chrono::Utc;
use crossbeam_channel::Sender;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pf_data::{CheckpointStore, Dataset};
use pf_optimizer::{
    cancel_pair, Attempt, CallContext, CallPolicy, CancelHandle, CancelToken, EventSink,
    GridResult, GridSearch, Optimizer, PipelineEvent, PipelineEventKind,
};
use pf_types::{config_error, FitResult, LinkSource, PfError, PfResult, SourcePhase};

use crate::collection::ResultsCollection;
use crate::config::{check_path_segment, RunConfig};
use crate::hyper::HyperExtender;
use crate::phase::{Phase, PhaseKind};
use crate::report::{PhaseRecord, PhaseStatus, RunReport, REPORT_FILE};

/// Diagnostic file holding every cell of a grid-search phase.
pub const GRID_FILE: &str = "grid.json";

/// Everything a pipeline run produced. On failure `error` is set and the
/// other fields hold whatever completed before it.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub results: ResultsCollection,
    /// Full grids of grid-search phases, keyed by phase name.
    pub grids: BTreeMap<String, GridResult>,
    pub report: RunReport,
    pub error: Option<PfError>,
}

struct PhaseOutput {
    result: FitResult,
    grid: Option<GridResult>,
    status: PhaseStatus,
    attempts: Vec<Attempt>,
}

/// A named group of phases sharing one run configuration and output folder.
///
/// A stage is only validated once it is part of a [`Pipeline`], so its
/// phases may link from phases of the stages composed before it.
#[derive(Debug)]
pub struct Stage {
    pub name: String,
    pub phases: Vec<Phase>,
    pub config: RunConfig,
}

impl Stage {
    pub fn new(name: impl Into<String>, phases: Vec<Phase>, config: RunConfig) -> Self {
        Self {
            name: name.into(),
            phases,
            config,
        }
    }

    /// Directory holding one sub-directory per phase of this stage.
    pub fn output_dir(&self) -> PathBuf {
        self.config.pipeline_dir(&self.name)
    }
}

/// An ordered, validated list of stages and their phases.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    events: EventSink,
    cancel_handle: CancelHandle,
    cancel: CancelToken,
}

impl Pipeline {
    /// Validate and build a single-stage pipeline. Every check that needs no
    /// optimizer output happens here, so a malformed pipeline fails before
    /// any fit.
    pub fn new(name: impl Into<String>, phases: Vec<Phase>, config: RunConfig) -> PfResult<Self> {
        Self::compose(vec![Stage::new(name, phases, config)])
    }

    /// Validate and build a pipeline that runs `stages` in order. Phase names
    /// are unique across all stages and links may cross stage boundaries.
    pub fn compose(stages: Vec<Stage>) -> PfResult<Self> {
        if stages.is_empty() {
            return Err(config_error!("pipeline has no stages"));
        }
        let mut names = HashSet::new();
        for stage in &stages {
            stage.config.validate()?;
            check_path_segment("pipeline name", &stage.name)?;
            if !names.insert(stage.name.as_str()) {
                return Err(config_error!("pipeline '{}' is composed twice", stage.name));
            }
            if stage.phases.is_empty() {
                return Err(config_error!("pipeline '{}' has no phases", stage.name));
            }
        }
        let phases: Vec<&Phase> = stages.iter().flat_map(|s| &s.phases).collect();
        validate_phases(&phases)?;

        let name = stages
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join("+");
        let (cancel_handle, cancel) = cancel_pair();
        Ok(Self {
            name,
            stages,
            events: EventSink::disabled(),
            cancel_handle,
            cancel,
        })
    }

    /// Append `next` after every stage of this pipeline and re-validate the
    /// joined phase list. The event sink and cancel handle carry over.
    pub fn then(self, next: Stage) -> PfResult<Self> {
        let Pipeline {
            mut stages,
            events,
            cancel_handle,
            cancel,
            ..
        } = self;
        stages.push(next);
        let mut pipeline = Self::compose(stages)?;
        pipeline.events = events;
        pipeline.cancel_handle = cancel_handle;
        pipeline.cancel = cancel;
        Ok(pipeline)
    }

    /// Report progress on `tx`.
    pub fn with_events(mut self, tx: Sender<PipelineEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn phases(&self) -> impl Iterator<Item = &Phase> {
        self.stages.iter().flat_map(|s| &s.phases)
    }

    /// Output directory of the first stage.
    pub fn output_dir(&self) -> PathBuf {
        self.stages
            .first()
            .map(Stage::output_dir)
            .unwrap_or_default()
    }

    /// Checkpoint directory of `phase`, inside its own stage's folder.
    pub fn phase_dir(&self, phase: &str) -> Option<PathBuf> {
        self.stages.iter().find_map(|stage| {
            stage
                .phases
                .iter()
                .any(|p| p.name == phase)
                .then(|| stage.output_dir().join(phase))
        })
    }

    /// Handle that stops the run at the next optimizer call or phase boundary.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }

    /// Run every phase; the first failure is returned as
    /// [`PfError::PhaseFailed`].
    pub async fn run(&self, optimizer: Arc<dyn Optimizer>, data: Dataset) -> PfResult<PipelineOutcome> {
        let mut outcome = self.execute(optimizer, data).await;
        match outcome.error.take() {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Run every phase and return whatever completed, including on failure.
    pub async fn execute(&self, optimizer: Arc<dyn Optimizer>, data: Dataset) -> PipelineOutcome {
        let mut outcome = PipelineOutcome {
            results: ResultsCollection::new(),
            grids: BTreeMap::new(),
            report: RunReport::new(self.name.clone(), self.output_dir()),
            error: None,
        };

        let mut stores = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let dir = stage.output_dir();
            match CheckpointStore::new(&dir) {
                Ok(store) => stores.push(store),
                Err(err) => {
                    error!(pipeline = %self.name, dir = %dir.display(), error = %err, "cannot open output directory");
                    outcome.error = Some(err);
                    return outcome;
                }
            }
        }

        let phase_count = self.phases().count();
        info!(
            pipeline = %self.name,
            stages = self.stages.len(),
            phases = phase_count,
            dir = %outcome.report.output_dir.display(),
            "starting pipeline"
        );
        self.events.emit(PipelineEventKind::PipelineStarted {
            pipeline: self.name.clone(),
            phases: phase_count,
        });

        for (stage, store) in self.stages.iter().zip(&stores) {
            for phase in &stage.phases {
                let started_at = Utc::now();
                let run = if self.cancel.is_cancelled() {
                    Err(PfError::Cancelled)
                } else {
                    self.run_phase(stage, phase, store, &outcome.results, &optimizer, &data)
                        .await
                };
                let appended = run.and_then(|output| {
                    outcome.results.append(phase.name.clone(), output.result.clone())?;
                    Ok(output)
                });

                match appended {
                    Ok(output) => {
                        let evidence = output.result.evidence;
                        self.events.emit(PipelineEventKind::PhaseCompleted {
                            phase: phase.name.clone(),
                            evidence,
                        });
                        outcome.report.phases.push(PhaseRecord {
                            phase: phase.name.clone(),
                            status: output.status,
                            evidence: Some(evidence),
                            hyper_evidence: output.result.hyper_combined.as_ref().map(|h| h.evidence),
                            attempts: output.attempts,
                            error_kind: None,
                            error: None,
                            started_at,
                            finished_at: Utc::now(),
                        });
                        if let Some(grid) = output.grid {
                            outcome.grids.insert(phase.name.clone(), grid);
                        }
                    }
                    Err(err) => {
                        let kind = err.kind();
                        let completed: Vec<String> =
                            outcome.results.names().into_iter().map(String::from).collect();
                        error!(
                            pipeline = %self.name,
                            stage = %stage.name,
                            phase = %phase.name,
                            kind = %kind,
                            completed = ?completed,
                            error = %err,
                            "phase failed"
                        );
                        self.events.emit(PipelineEventKind::PhaseFailed {
                            phase: phase.name.clone(),
                            kind,
                            error: err.to_string(),
                        });
                        outcome.report.phases.push(PhaseRecord {
                            phase: phase.name.clone(),
                            status: PhaseStatus::Failed,
                            evidence: None,
                            hyper_evidence: None,
                            attempts: Vec::new(),
                            error_kind: Some(kind),
                            error: Some(err.to_string()),
                            started_at,
                            finished_at: Utc::now(),
                        });
                        outcome.error = Some(PfError::PhaseFailed {
                            phase: phase.name.clone(),
                            kind,
                            completed,
                            source: Box::new(err),
                        });
                        self.write_report(&stores, &outcome.report);
                        return outcome;
                    }
                }
            }
        }

        outcome.report.finished_at = Some(Utc::now());
        self.write_report(&stores, &outcome.report);
        info!(
            pipeline = %self.name,
            completed = outcome.report.count(PhaseStatus::Completed),
            resumed = outcome.report.count(PhaseStatus::Resumed),
            "pipeline complete"
        );
        self.events.emit(PipelineEventKind::PipelineCompleted {
            pipeline: self.name.clone(),
            phases: phase_count,
        });
        outcome
    }

    async fn run_phase(
        &self,
        stage: &Stage,
        phase: &Phase,
        store: &CheckpointStore,
        results: &ResultsCollection,
        optimizer: &Arc<dyn Optimizer>,
        data: &Dataset,
    ) -> PfResult<PhaseOutput> {
        info!(phase = %phase.name, "starting phase");
        self.events.emit(PipelineEventKind::PhaseStarted {
            phase: phase.name.clone(),
        });

        let model = phase.links.apply(&phase.name, &phase.model, results)?;

        if stage.config.resume {
            if let Some(stored) = store.load(&phase.name)? {
                if stored.model != model {
                    warn!(
                        phase = %phase.name,
                        "checkpointed model differs from the linked model, reusing stored result"
                    );
                }
                let grid = match phase.kind {
                    PhaseKind::GridSearch(_) => store.read_artifact(&phase.name, GRID_FILE)?,
                    PhaseKind::Single => None,
                };
                info!(phase = %phase.name, evidence = stored.result.evidence, "resumed from checkpoint");
                self.events.emit(PipelineEventKind::PhaseResumed {
                    phase: phase.name.clone(),
                    evidence: stored.result.evidence,
                });
                return Ok(PhaseOutput {
                    result: stored.result,
                    grid,
                    status: PhaseStatus::Resumed,
                    attempts: Vec::new(),
                });
            }
        }
        store.invalidate(&phase.name)?;

        debug!(
            phase = %phase.name,
            free = model.free_parameter_count(),
            parameters = model.parameter_count(),
            "linked model"
        );

        let policy = CallPolicy {
            timeout: phase.timeout.or_else(|| stage.config.default_timeout()),
            retry: phase.retry.clone().unwrap_or_else(|| stage.config.retry.clone()),
        };
        let ctx = CallContext::new(optimizer.clone(), data.clone())
            .with_policy(policy)
            .with_cancel(self.cancel.clone())
            .with_events(self.events.clone());

        let (mut result, grid, mut attempts) = match &phase.kind {
            PhaseKind::Single => {
                let outcome = ctx.fit(&phase.name, &model, &phase.settings).await?;
                (outcome.result, None, outcome.attempts)
            }
            PhaseKind::GridSearch(spec) => {
                let outcome = GridSearch::new(ctx.clone(), stage.config.max_workers)
                    .run(&phase.name, spec, &model, &phase.settings)
                    .await?;
                (outcome.grid.best().clone(), Some(outcome.grid), outcome.attempts)
            }
        };

        if let Some(hyper) = &phase.hyper {
            let extended = HyperExtender::new(ctx)
                .extend(&phase.name, &result, hyper, &phase.settings)
                .await?;
            attempts.extend(extended.attempts);
            result = result.with_hyper_combined(extended.combined);
        }
        result.validate()?;

        if let Some(grid) = &grid {
            store.write_artifact(&phase.name, GRID_FILE, grid)?;
        }
        store.save(&phase.name, &model, &result)?;

        info!(
            phase = %phase.name,
            evidence = result.evidence,
            attempts = attempts.len(),
            "phase complete"
        );
        Ok(PhaseOutput {
            result,
            grid,
            status: PhaseStatus::Completed,
            attempts,
        })
    }

    /// Every stage folder gets the report of the whole run.
    fn write_report(&self, stores: &[CheckpointStore], report: &RunReport) {
        let bytes = match serde_json::to_vec_pretty(report) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(pipeline = %self.name, error = %err, "failed to serialize run report");
                return;
            }
        };
        for store in stores {
            let path = store.root().join(REPORT_FILE);
            if let Err(err) = std::fs::write(&path, &bytes) {
                warn!(path = %path.display(), error = %err, "failed to write run report");
            }
        }
    }
}

/// Names are unique directory names, every referenced phase runs strictly
/// earlier, and hyper-combined sources come from phases that have one.
fn validate_phases(phases: &[&Phase]) -> PfResult<()> {
    if phases.is_empty() {
        return Err(config_error!("pipeline has no phases"));
    }

    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (index, phase) in phases.iter().enumerate() {
        check_path_segment("phase name", &phase.name)?;
        if positions.insert(phase.name.as_str(), index).is_some() {
            return Err(config_error!("phase name '{}' is used twice", phase.name));
        }
    }

    for (index, phase) in phases.iter().enumerate() {
        phase.validate()?;

        for dep in phase.links.dependencies() {
            source_index(&positions, index, &phase.name, &dep)?;
        }

        for rule in phase.links.rules() {
            if !matches!(rule.from, LinkSource::HyperConstant | LinkSource::HyperVariable) {
                continue;
            }
            let source = source_index(&positions, index, &phase.name, &rule.phase)?;
            if phases[source].hyper.is_none() {
                return Err(config_error!(
                    "phase '{}' links from the hyper-combined result of '{}', which has no hyper extension",
                    phase.name,
                    phases[source].name
                ));
            }
        }
    }
    Ok(())
}

fn source_index(
    positions: &HashMap<&str, usize>,
    index: usize,
    phase: &str,
    dep: &SourcePhase,
) -> PfResult<usize> {
    match dep {
        SourcePhase::Last if index == 0 => Err(config_error!(
            "phase '{phase}' links from the previous phase but is the first phase"
        )),
        SourcePhase::Last => Ok(index - 1),
        SourcePhase::Named(name) => match positions.get(name.as_str()) {
            Some(&source) if source < index => Ok(source),
            Some(_) => Err(config_error!(
                "phase '{phase}' links from '{name}', which does not run before it"
            )),
            None => Err(config_error!(
                "phase '{phase}' links from unknown phase '{name}'"
            )),
        },
    }
}
