// Hyper-phase extension: refine nuisance components around a fixed main model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::task::JoinSet;
use tracing::{debug, info};

use pf_optimizer::{Attempt, CallContext, OptimizerSettings, PipelineEventKind};
use pf_types::{config_error, internal_error, Component, FitResult, Model, PfError, PfResult};

/// Auxiliary parameter groups a phase can be extended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HyperGroup {
    /// Per-galaxy noise scaling.
    GalaxyNoise,
    /// Constant background sky level.
    BackgroundSky,
    /// Background noise level.
    BackgroundNoise,
    /// Regularization of the source reconstruction.
    SourceRegularization,
}

impl HyperGroup {
    /// Component name the group's parameters live under.
    pub fn component_name(&self) -> &'static str {
        match self {
            HyperGroup::GalaxyNoise => "hyper_galaxy",
            HyperGroup::BackgroundSky => "hyper_image_sky",
            HyperGroup::BackgroundNoise => "hyper_noise_background",
            HyperGroup::SourceRegularization => "regularization",
        }
    }
}

impl std::fmt::Display for HyperGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.component_name())
    }
}

/// Enabled groups and the free component each one fits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperSettings {
    pub groups: BTreeMap<HyperGroup, Component>,
}

impl HyperSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: HyperGroup, component: Component) -> Self {
        self.groups.insert(group, component);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn validate(&self) -> PfResult<()> {
        for (group, component) in &self.groups {
            if component.parameters.is_empty() {
                return Err(config_error!("hyper group {group} has no parameters"));
            }
            for (name, prior) in &component.parameters {
                prior.validate(&format!("{group}.{name}"))?;
            }
        }
        Ok(())
    }
}

/// The combined hyper result plus what it took to get there.
#[derive(Debug, Clone)]
pub struct HyperOutcome {
    pub combined: FitResult,
    pub groups: BTreeMap<HyperGroup, FitResult>,
    pub attempts: Vec<Attempt>,
}

/// Runs hyper groups for one completed phase.
pub struct HyperExtender {
    ctx: CallContext,
}

impl HyperExtender {
    pub fn new(ctx: CallContext) -> Self {
        Self { ctx }
    }

    /// Fit each enabled group against `base.constant`, then fit all groups
    /// together seeded from the individual fits. With no groups enabled the
    /// combined result is `base` itself.
    pub async fn extend(
        &self,
        phase: &str,
        base: &FitResult,
        hyper: &HyperSettings,
        settings: &OptimizerSettings,
    ) -> PfResult<HyperOutcome> {
        if hyper.is_empty() {
            return Ok(HyperOutcome {
                combined: base.clone(),
                groups: BTreeMap::new(),
                attempts: Vec::new(),
            });
        }

        info!(phase = %phase, groups = hyper.groups.len(), "extending phase with hyper groups");

        let mut tasks = JoinSet::new();
        for (&group, component) in &hyper.groups {
            let mut model = base.constant.clone();
            model.insert_component(group.component_name(), component.clone());
            let ctx = self.ctx.clone();
            let settings = settings.clone();
            let label = format!("{phase}/{group}");
            tasks.spawn(async move {
                let outcome = ctx.fit(&label, &model, &settings).await?;
                Ok::<_, PfError>((group, outcome))
            });
        }

        // Every group must finish before the combined fit starts.
        let mut groups = BTreeMap::new();
        let mut attempts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| internal_error!("hyper group task failed: {e}"))
                .and_then(|r| r);
            let (group, outcome) = match outcome {
                Ok(done) => done,
                Err(err) => {
                    tasks.abort_all();
                    return Err(err);
                }
            };
            debug!(phase = %phase, group = %group, evidence = outcome.result.evidence, "hyper group fitted");
            self.ctx.events.emit(PipelineEventKind::HyperGroupCompleted {
                phase: phase.to_string(),
                group: group.to_string(),
                evidence: outcome.result.evidence,
            });
            attempts.extend(outcome.attempts);
            groups.insert(group, outcome.result);
        }

        let combined_model = combined_model(base, &groups)?;
        let label = format!("{phase}/hyper_combined");
        let outcome = self.ctx.fit(&label, &combined_model, settings).await?;
        attempts.extend(outcome.attempts);

        info!(phase = %phase, evidence = outcome.result.evidence, "hyper combined fit complete");
        Ok(HyperOutcome {
            combined: outcome.result,
            groups,
            attempts,
        })
    }
}

/// Main parameters fixed at the base point estimate; every group's
/// component free, seeded with that group's posterior.
fn combined_model(base: &FitResult, groups: &BTreeMap<HyperGroup, FitResult>) -> PfResult<Model> {
    let mut model = base.constant.clone();
    for (group, result) in groups {
        let name = group.component_name();
        let component = result.variable.component(name).cloned().ok_or_else(|| {
            internal_error!("hyper group {group} result lost its {name} component")
        })?;
        model.insert_component(name, component);
    }
    model.validate()?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_data::Dataset;
    use pf_optimizer::SyntheticOptimizer;
    use pf_types::{ErrorKind, ParamPath, Prior};
    use std::sync::Arc;

    fn base_result() -> FitResult {
        let variable = Model::builder()
            .component("lens", "sie")
            .param("einstein_radius", Prior::gaussian(1.2, 0.05))
            .build()
            .unwrap();
        FitResult::new(variable.fixed_at(|_, p| p.centre()), variable, -5.0)
    }

    fn hyper() -> HyperSettings {
        HyperSettings::new()
            .with_group(
                HyperGroup::GalaxyNoise,
                Component::new("hyper_galaxy").with_param("noise_factor", Prior::uniform(0.0, 2.0)),
            )
            .with_group(
                HyperGroup::BackgroundSky,
                Component::new("hyper_image_sky").with_param("sky_scale", Prior::uniform(-1.0, 1.0)),
            )
    }

    fn optimizer() -> SyntheticOptimizer {
        SyntheticOptimizer::new()
            .with_target(ParamPath::new("lens", "einstein_radius"), 1.2)
            .with_target(ParamPath::new("hyper_galaxy", "noise_factor"), 0.7)
            .with_target(ParamPath::new("hyper_image_sky", "sky_scale"), 0.3)
    }

    #[tokio::test]
    async fn test_no_groups_returns_base() {
        let ctx = CallContext::new(Arc::new(optimizer()), Dataset::empty("d"));
        let base = base_result();
        let outcome = HyperExtender::new(ctx)
            .extend("phase_1", &base, &HyperSettings::new(), &OptimizerSettings::default())
            .await
            .unwrap();
        assert_eq!(outcome.combined, base);
        assert!(outcome.groups.is_empty());
        assert!(outcome.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_combined_evidence_dominates_groups() {
        let synthetic = Arc::new(optimizer());
        let ctx = CallContext::new(synthetic.clone(), Dataset::empty("d"));
        let outcome = HyperExtender::new(ctx)
            .extend("phase_1", &base_result(), &hyper(), &OptimizerSettings::default())
            .await
            .unwrap();

        assert_eq!(outcome.groups.len(), 2);
        for result in outcome.groups.values() {
            assert!(outcome.combined.evidence >= result.evidence);
        }
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(synthetic.call_count(), 3);

        // Main parameters stay fixed in every hyper fit.
        for model in synthetic.calls() {
            assert!(model
                .prior(&ParamPath::new("lens", "einstein_radius"))
                .unwrap()
                .is_fixed());
        }

        // The combined fit frees both groups, seeded from their posteriors.
        let combined_call = synthetic.calls().pop().unwrap();
        assert_eq!(combined_call.free_parameter_count(), 2);
        assert_eq!(
            combined_call.prior(&ParamPath::new("hyper_galaxy", "noise_factor")),
            Some(&Prior::gaussian(0.7, 0.05))
        );
        assert_eq!(
            outcome
                .combined
                .best_value(&ParamPath::new("hyper_image_sky", "sky_scale"))
                .unwrap(),
            0.3
        );
    }

    #[tokio::test]
    async fn test_group_failure_propagates() {
        let synthetic = optimizer().failing_for_component("hyper_image_sky");
        let ctx = CallContext::new(Arc::new(synthetic), Dataset::empty("d"));
        let err = HyperExtender::new(ctx)
            .extend("phase_1", &base_result(), &hyper(), &OptimizerSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Optimization);
    }

    #[test]
    fn test_settings_validation() {
        assert!(hyper().validate().is_ok());
        let empty = HyperSettings::new().with_group(HyperGroup::BackgroundNoise, Component::new("noise"));
        assert_eq!(empty.validate().unwrap_err().kind(), ErrorKind::Config);
        assert_eq!(HyperGroup::SourceRegularization.to_string(), "regularization");
    }
}
