//! The outcome of one optimizer call.

use serde::{Deserialize, Serialize};

use crate::errors::{OptimizationError, PfResult, ResultsError};
use crate::model::{Model, ParamPath};
use crate::prior::Prior;

/// Result of a single phase (or grid cell, or hyper phase).
///
/// `constant` holds the best-fit point estimate (every parameter fixed),
/// `variable` the posterior. A phase extended with hyper phases carries the
/// combined hyper result in `hyper_combined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub constant: Model,
    pub variable: Model,
    pub evidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyper_combined: Option<Box<FitResult>>,
}

/// One row of a posterior summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSummary {
    pub path: ParamPath,
    pub best: f64,
    pub uncertainty: f64,
}

/// Compact view of a result used for checkpoints and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub evidence: f64,
    pub parameters: Vec<ParamSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyper_combined_evidence: Option<f64>,
}

/// Which model of a past result a link draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    Constant,
    Variable,
    HyperConstant,
    HyperVariable,
}

/// A parameter as seen by the prior linker: its posterior distribution and
/// its best-fit value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceParam {
    pub distribution: Prior,
    pub best: f64,
}

impl FitResult {
    pub fn new(constant: Model, variable: Model, evidence: f64) -> Self {
        Self {
            constant,
            variable,
            evidence,
            hyper_combined: None,
        }
    }

    pub fn with_hyper_combined(mut self, combined: FitResult) -> Self {
        self.hyper_combined = Some(Box::new(combined));
        self
    }

    /// Best-fit value of a parameter.
    pub fn best_value(&self, path: &ParamPath) -> PfResult<f64> {
        let prior = self.constant.require(path)?;
        Ok(prior.fixed_value().unwrap_or_else(|| prior.centre()))
    }

    /// Resolve the result a link source points at (`self` or the hyper
    /// combined result). `phase` names the owning phase in errors.
    pub fn resolve(&self, source: LinkSource, phase: &str) -> PfResult<&FitResult> {
        match source {
            LinkSource::Constant | LinkSource::Variable => Ok(self),
            LinkSource::HyperConstant | LinkSource::HyperVariable => self
                .hyper_combined
                .as_deref()
                .ok_or_else(|| {
                    ResultsError::NoHyperCombined {
                        name: phase.to_string(),
                    }
                    .into()
                }),
        }
    }

    /// Look up a parameter through an explicit link source.
    pub fn source_param(
        &self,
        source: LinkSource,
        path: &ParamPath,
        phase: &str,
    ) -> PfResult<SourceParam> {
        let result = self.resolve(source, phase)?;
        let best = result.best_value(path)?;
        let distribution = match source {
            LinkSource::Constant | LinkSource::HyperConstant => *result.constant.require(path)?,
            LinkSource::Variable | LinkSource::HyperVariable => *result.variable.require(path)?,
        };
        Ok(SourceParam { distribution, best })
    }

    /// Reject results that must never be stored.
    pub fn validate(&self) -> Result<(), OptimizationError> {
        if !self.evidence.is_finite() {
            return Err(OptimizationError::InvalidResult {
                message: format!("evidence is not finite: {}", self.evidence),
            });
        }
        if let Some((path, prior)) = self.constant.iter().find(|(_, p)| !p.is_fixed()) {
            return Err(OptimizationError::InvalidResult {
                message: format!("constant model parameter {path} is not fixed: {prior}"),
            });
        }
        if self.constant.paths() != self.variable.paths() {
            return Err(OptimizationError::InvalidResult {
                message: "constant and variable models have different parameters".to_string(),
            });
        }
        if let Some(hyper) = &self.hyper_combined {
            hyper.validate()?;
        }
        Ok(())
    }

    pub fn summary(&self) -> PosteriorSummary {
        let parameters = self
            .variable
            .iter()
            .map(|(path, posterior)| {
                let best = self
                    .constant
                    .prior(&path)
                    .and_then(Prior::fixed_value)
                    .unwrap_or_else(|| posterior.centre());
                ParamSummary {
                    path,
                    best,
                    uncertainty: posterior.spread(),
                }
            })
            .collect();
        PosteriorSummary {
            evidence: self.evidence,
            parameters,
            hyper_combined_evidence: self.hyper_combined.as_ref().map(|h| h.evidence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> FitResult {
        let variable = Model::builder()
            .component("lens", "sie")
            .param("a", Prior::gaussian(1.0, 0.2))
            .param("b", Prior::fixed(5.0))
            .build()
            .unwrap();
        let constant = variable.fixed_at(|_, p| p.centre());
        FitResult::new(constant, variable, -12.5)
    }

    #[test]
    fn source_param_honours_link_source() {
        let result = sample_result();
        let a = ParamPath::new("lens", "a");

        let from_variable = result.source_param(LinkSource::Variable, &a, "p1").unwrap();
        assert_eq!(from_variable.distribution, Prior::gaussian(1.0, 0.2));
        assert_eq!(from_variable.best, 1.0);

        let from_constant = result.source_param(LinkSource::Constant, &a, "p1").unwrap();
        assert_eq!(from_constant.distribution, Prior::fixed(1.0));

        let missing_hyper = result.source_param(LinkSource::HyperConstant, &a, "p1");
        assert!(matches!(
            missing_hyper,
            Err(crate::PfError::Results(ResultsError::NoHyperCombined { .. }))
        ));
    }

    #[test]
    fn hyper_sources_read_combined_result() {
        let mut hyper = sample_result();
        hyper.constant = hyper.variable.fixed_at(|_, _| 7.0);
        let result = sample_result().with_hyper_combined(hyper);
        let a = ParamPath::new("lens", "a");
        let p = result.source_param(LinkSource::HyperConstant, &a, "p1").unwrap();
        assert_eq!(p.best, 7.0);
    }

    #[test]
    fn validate_rejects_corrupt_results() {
        let mut result = sample_result();
        assert!(result.validate().is_ok());

        result.evidence = f64::NAN;
        assert!(result.validate().is_err());

        let mut result = sample_result();
        result.constant = result.variable.clone();
        assert!(result.validate().is_err());

        let mut result = sample_result();
        result.variable.insert_component("extra", crate::Component::new("x"));
        result
            .variable
            .components
            .get_mut("extra")
            .unwrap()
            .parameters
            .insert("y".into(), Prior::uniform(0.0, 1.0));
        assert!(result.validate().is_err());
    }

    #[test]
    fn summary_reports_best_and_uncertainty() {
        let summary = sample_result().summary();
        assert_eq!(summary.evidence, -12.5);
        assert_eq!(summary.parameters.len(), 2);
        let a = &summary.parameters[0];
        assert_eq!(a.path, ParamPath::new("lens", "a"));
        assert_eq!(a.best, 1.0);
        assert_eq!(a.uncertainty, 0.2);
        assert!(summary.hyper_combined_evidence.is_none());
    }
}
