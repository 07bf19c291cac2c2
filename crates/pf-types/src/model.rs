//! Structured model specifications.
//!
//! A [`Model`] maps component names (e.g. `"lens"`, `"source"`, `"subhalo"`)
//! to a profile kind and a set of named parameter priors. Parameters are
//! always addressed by an explicit `(component, parameter)` pair, see
//! [`ParamPath`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{PfError, PfResult, ResultsError};
use crate::prior::Prior;

/// Address of one parameter inside a model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamPath {
    pub component: String,
    pub parameter: String,
}

impl ParamPath {
    pub fn new(component: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            parameter: parameter.into(),
        }
    }

    /// Parse `"component.parameter"`.
    pub fn parse(path: &str) -> PfResult<Self> {
        match path.split_once('.') {
            Some((component, parameter)) if !component.is_empty() && !parameter.is_empty() => {
                Ok(Self::new(component, parameter))
            }
            _ => Err(PfError::Config(format!(
                "parameter path '{path}' must look like 'component.parameter'"
            ))),
        }
    }
}

impl std::fmt::Display for ParamPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.component, self.parameter)
    }
}

/// One model component: a profile kind plus its parameter priors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub kind: String,
    pub parameters: BTreeMap<String, Prior>,
}

impl Component {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, prior: Prior) -> Self {
        self.parameters.insert(name.into(), prior);
        self
    }
}

/// Mapping from component name to [`Component`].
///
/// Models are value types: linking always builds a fresh model for every
/// optimizer call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub components: BTreeMap<String, Component>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    pub fn prior(&self, path: &ParamPath) -> Option<&Prior> {
        self.components
            .get(&path.component)
            .and_then(|c| c.parameters.get(&path.parameter))
    }

    /// Like [`Model::prior`], failing with a not-found error.
    pub fn require(&self, path: &ParamPath) -> PfResult<&Prior> {
        self.prior(path).ok_or_else(|| {
            ResultsError::ParameterNotFound {
                path: path.to_string(),
            }
            .into()
        })
    }

    /// Replace the prior of an existing parameter.
    pub fn set_prior(&mut self, path: &ParamPath, prior: Prior) -> PfResult<()> {
        let slot = self
            .components
            .get_mut(&path.component)
            .and_then(|c| c.parameters.get_mut(&path.parameter))
            .ok_or_else(|| {
                PfError::Config(format!("model has no parameter {path} to link onto"))
            })?;
        *slot = prior;
        Ok(())
    }

    /// Insert or replace a whole component.
    pub fn insert_component(&mut self, name: impl Into<String>, component: Component) {
        self.components.insert(name.into(), component);
    }

    /// All parameter paths in deterministic (component, parameter) order.
    pub fn paths(&self) -> Vec<ParamPath> {
        self.components
            .iter()
            .flat_map(|(name, c)| c.parameters.keys().map(move |p| ParamPath::new(name, p)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamPath, &Prior)> + '_ {
        self.components.iter().flat_map(|(name, c)| {
            c.parameters
                .iter()
                .map(move |(p, prior)| (ParamPath::new(name, p), prior))
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.components.values().map(|c| c.parameters.len()).sum()
    }

    pub fn free_parameter_count(&self) -> usize {
        self.iter().filter(|(_, p)| !p.is_fixed()).count()
    }

    /// Every prior is `Fixed`.
    pub fn is_point_estimate(&self) -> bool {
        self.iter().all(|(_, p)| p.is_fixed())
    }

    /// Same model with every parameter fixed at `value_of(path, prior)`.
    pub fn fixed_at(&self, mut value_of: impl FnMut(&ParamPath, &Prior) -> f64) -> Model {
        let mut out = self.clone();
        for (name, component) in out.components.iter_mut() {
            for (param, prior) in component.parameters.iter_mut() {
                let path = ParamPath::new(name.as_str(), param.as_str());
                let value = value_of(&path, prior);
                *prior = Prior::fixed(value).with_optional_domain(prior.domain);
            }
        }
        out
    }

    /// Validate every prior in the model.
    pub fn validate(&self) -> PfResult<()> {
        for (path, prior) in self.iter() {
            prior.validate(&path.to_string())?;
        }
        Ok(())
    }
}

/// Fluent builder keyed by component and parameter names.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    components: BTreeMap<String, Component>,
    current: Option<String>,
    errors: Vec<String>,
}

impl ModelBuilder {
    /// Start (or reopen) a component.
    pub fn component(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        let name = name.into();
        let kind = kind.into();
        match self.components.get(&name) {
            Some(existing) if existing.kind != kind => {
                self.errors.push(format!(
                    "component '{name}' declared as both '{}' and '{kind}'",
                    existing.kind
                ));
            }
            Some(_) => {}
            None => {
                self.components.insert(name.clone(), Component::new(kind));
            }
        }
        self.current = Some(name);
        self
    }

    /// Add a parameter to the most recently opened component.
    pub fn param(mut self, name: impl Into<String>, prior: Prior) -> Self {
        let name = name.into();
        match self
            .current
            .as_ref()
            .and_then(|c| self.components.get_mut(c))
        {
            Some(component) => {
                if component.parameters.insert(name.clone(), prior).is_some() {
                    self.errors.push(format!("parameter '{name}' declared twice"));
                }
            }
            None => self
                .errors
                .push(format!("parameter '{name}' declared before any component")),
        }
        self
    }

    pub fn build(self) -> PfResult<Model> {
        if !self.errors.is_empty() {
            return Err(PfError::Config(self.errors.join("; ")));
        }
        let model = Model {
            components: self.components,
        };
        model.validate()?;
        Ok(model)
    }
}
