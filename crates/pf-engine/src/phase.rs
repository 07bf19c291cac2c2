// Phase definitions and the declarative prior-link plan

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use pf_optimizer::{GridSpec, OptimizerSettings, RetryPolicy};
use pf_types::{
    config_error, Component, FitResult, LinkRule, LinkSource, LinkTarget, Model, ParamPath,
    PfResult, Prior, PriorLinker, ResultsError, SourcePhase,
};

use crate::collection::ResultsCollection;
use crate::hyper::HyperSettings;

/// User hook run after the declarative rules: `(linked model, results) -> model`.
pub type DeriveFn = Arc<dyn Fn(Model, &ResultsCollection) -> PfResult<Model> + Send + Sync>;

#[derive(Clone)]
struct CustomDerive {
    dependencies: Vec<String>,
    derive: DeriveFn,
}

/// How a phase builds its model from earlier results.
///
/// Applied in order: link rules, then literal overrides, then the optional
/// custom hook. The result is validated before it reaches the optimizer.
#[derive(Clone, Default)]
pub struct LinkPlan {
    rules: Vec<LinkRule>,
    overrides: Vec<(ParamPath, Prior)>,
    custom: Option<CustomDerive>,
}

impl fmt::Debug for LinkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkPlan")
            .field("rules", &self.rules)
            .field("overrides", &self.overrides)
            .field(
                "custom_dependencies",
                &self.custom.as_ref().map(|c| &c.dependencies),
            )
            .finish()
    }
}

impl LinkPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: LinkRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Replace a parameter's prior with a literal after linking.
    pub fn override_prior(mut self, path: ParamPath, prior: Prior) -> Self {
        self.overrides.push((path, prior));
        self
    }

    /// Attach a custom hook. `dependencies` names every phase it reads so
    /// they can be checked before the pipeline starts.
    pub fn derive<F>(mut self, dependencies: &[&str], derive: F) -> Self
    where
        F: Fn(Model, &ResultsCollection) -> PfResult<Model> + Send + Sync + 'static,
    {
        self.custom = Some(CustomDerive {
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            derive: Arc::new(derive),
        });
        self
    }

    pub fn rules(&self) -> &[LinkRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.overrides.is_empty() && self.custom.is_none()
    }

    /// Every source phase the plan reads, rules first.
    pub fn dependencies(&self) -> Vec<SourcePhase> {
        let mut deps: Vec<SourcePhase> = self.rules.iter().map(|r| r.phase.clone()).collect();
        if let Some(custom) = &self.custom {
            deps.extend(custom.dependencies.iter().cloned().map(SourcePhase::Named));
        }
        deps
    }

    /// Whether any rule or override writes `path`. A custom hook may write
    /// anything.
    pub fn targets(&self, path: &ParamPath) -> bool {
        self.overrides.iter().any(|(p, _)| p == path)
            || self.rules.iter().any(|rule| match &rule.target {
                LinkTarget::Parameter { target, .. } => target == path,
                LinkTarget::Component { target, .. } => *target == path.component,
            })
            || self.custom.is_some()
    }

    /// Build the concrete model for `phase` from `base` and the results of
    /// every earlier phase.
    pub fn apply(&self, phase: &str, base: &Model, results: &ResultsCollection) -> PfResult<Model> {
        let mut model = base.clone();

        for rule in &self.rules {
            let (source_name, source) = match &rule.phase {
                SourcePhase::Named(name) => (name.as_str(), results.from_phase(name)?),
                SourcePhase::Last => results.last()?,
            };
            apply_rule(&mut model, rule, source_name, source)?;
            debug!(
                phase = %phase,
                source = %source_name,
                from = ?rule.from,
                target = ?rule.target,
                mode = ?rule.mode,
                "linked prior"
            );
        }

        for (path, prior) in &self.overrides {
            model.set_prior(path, *prior)?;
        }

        if let Some(custom) = &self.custom {
            model = (custom.derive)(model, results)?;
        }

        model.validate()?;
        Ok(model)
    }
}

fn apply_rule(model: &mut Model, rule: &LinkRule, source_name: &str, source: &FitResult) -> PfResult<()> {
    match &rule.target {
        LinkTarget::Parameter { target, source: path } => {
            let param = source.source_param(rule.from, path, source_name)?;
            let prior = PriorLinker::link(target, &param, rule.mode)?;
            model.set_prior(target, prior)
        }
        LinkTarget::Component { target, source: component } => {
            let resolved = source.resolve(rule.from, source_name)?;
            let origin = match rule.from {
                LinkSource::Constant | LinkSource::HyperConstant => &resolved.constant,
                LinkSource::Variable | LinkSource::HyperVariable => &resolved.variable,
            };
            let origin = origin
                .component(component)
                .ok_or_else(|| ResultsError::ComponentNotFound {
                    component: component.clone(),
                })?;

            let mut linked = model
                .component(target)
                .cloned()
                .unwrap_or_else(|| Component::new(origin.kind.clone()));
            for name in origin.parameters.keys() {
                let from = ParamPath::new(component.clone(), name.clone());
                let to = ParamPath::new(target.clone(), name.clone());
                let param = source.source_param(rule.from, &from, source_name)?;
                linked
                    .parameters
                    .insert(name.clone(), PriorLinker::link(&to, &param, rule.mode)?);
            }
            model.insert_component(target.clone(), linked);
            Ok(())
        }
    }
}

/// Single fit or grid search.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseKind {
    Single,
    GridSearch(GridSpec),
}

/// One optimization unit of a pipeline.
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    /// Model before linking; parameters no rule touches keep these priors.
    pub model: Model,
    pub links: LinkPlan,
    pub settings: OptimizerSettings,
    pub kind: PhaseKind,
    /// Hyper groups refined after the phase's own fit.
    pub hyper: Option<HyperSettings>,
    /// Per-call deadline overriding the run default.
    pub timeout: Option<Duration>,
    /// Retry policy overriding the run default.
    pub retry: Option<RetryPolicy>,
}

impl Phase {
    pub fn new(name: impl Into<String>, model: Model) -> Self {
        Self {
            name: name.into(),
            model,
            links: LinkPlan::default(),
            settings: OptimizerSettings::default(),
            kind: PhaseKind::Single,
            hyper: None,
            timeout: None,
            retry: None,
        }
    }

    pub fn with_links(mut self, links: LinkPlan) -> Self {
        self.links = links;
        self
    }

    pub fn with_settings(mut self, settings: OptimizerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn grid_search(mut self, spec: GridSpec) -> Self {
        self.kind = PhaseKind::GridSearch(spec);
        self
    }

    pub fn with_hyper(mut self, hyper: HyperSettings) -> Self {
        self.hyper = Some(hyper);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn is_grid_search(&self) -> bool {
        matches!(self.kind, PhaseKind::GridSearch(_))
    }

    /// Checks that need no results: the base model, and grid axes that no
    /// link can change.
    pub fn validate(&self) -> PfResult<()> {
        self.model.validate().map_err(|e| {
            config_error!("phase '{}' has an invalid model: {e}", self.name)
        })?;
        if let PhaseKind::GridSearch(spec) = &self.kind {
            spec.check_shape()?;
            if !self.links.targets(&spec.param_a) && !self.links.targets(&spec.param_b) {
                spec.cells(&self.model)?;
            }
        }
        if let Some(hyper) = &self.hyper {
            hyper.validate()?;
        }
        Ok(())
    }
}
