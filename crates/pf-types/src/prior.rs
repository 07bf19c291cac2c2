//! Prior distributions over a single model parameter.

use serde::{Deserialize, Serialize};

use crate::errors::{PfError, PfResult};

/// Hard bounds a parameter can never leave, whatever its prior says.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub lower: f64,
    pub upper: f64,
}

impl Domain {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Domain of a parameter that must stay non-negative.
    pub fn positive() -> Self {
        Self {
            lower: 0.0,
            upper: f64::MAX,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.lower >= 0.0
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower).min(self.upper)
    }
}

/// Shape of a prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PriorShape {
    Fixed { value: f64 },
    Uniform { lower: f64, upper: f64 },
    Gaussian { mean: f64, sigma: f64 },
}

/// A parameter's pre-fit distribution or fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    pub shape: PriorShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,
}

impl Prior {
    pub fn fixed(value: f64) -> Self {
        Self {
            shape: PriorShape::Fixed { value },
            domain: None,
        }
    }

    pub fn uniform(lower: f64, upper: f64) -> Self {
        Self {
            shape: PriorShape::Uniform { lower, upper },
            domain: None,
        }
    }

    pub fn gaussian(mean: f64, sigma: f64) -> Self {
        Self {
            shape: PriorShape::Gaussian { mean, sigma },
            domain: None,
        }
    }

    pub fn with_domain(mut self, lower: f64, upper: f64) -> Self {
        self.domain = Some(Domain::new(lower, upper));
        self
    }

    pub fn with_optional_domain(mut self, domain: Option<Domain>) -> Self {
        self.domain = domain;
        self
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.shape, PriorShape::Fixed { .. })
    }

    pub fn fixed_value(&self) -> Option<f64> {
        match self.shape {
            PriorShape::Fixed { value } => Some(value),
            _ => None,
        }
    }

    /// Finite `(lower, upper)` of a uniform prior.
    pub fn uniform_bounds(&self) -> Option<(f64, f64)> {
        match self.shape {
            PriorShape::Uniform { lower, upper } if lower.is_finite() && upper.is_finite() => {
                Some((lower, upper))
            }
            _ => None,
        }
    }

    /// Central value of the prior: the fixed value, the uniform midpoint or
    /// the gaussian mean.
    pub fn centre(&self) -> f64 {
        match self.shape {
            PriorShape::Fixed { value } => value,
            PriorShape::Uniform { lower, upper } => 0.5 * (lower + upper),
            PriorShape::Gaussian { mean, .. } => mean,
        }
    }

    /// Standard deviation implied by the prior (zero when fixed).
    pub fn spread(&self) -> f64 {
        match self.shape {
            PriorShape::Fixed { .. } => 0.0,
            PriorShape::Uniform { lower, upper } => (upper - lower) / 12f64.sqrt(),
            PriorShape::Gaussian { sigma, .. } => sigma,
        }
    }

    /// Check the prior is well formed. `label` names the parameter in errors.
    pub fn validate(&self, label: &str) -> PfResult<()> {
        match self.shape {
            PriorShape::Fixed { value } => {
                if !value.is_finite() {
                    return Err(PfError::Config(format!(
                        "fixed prior for {label} is not finite: {value}"
                    )));
                }
            }
            PriorShape::Uniform { lower, upper } => {
                if !lower.is_finite() || !upper.is_finite() || lower >= upper {
                    return Err(PfError::Config(format!(
                        "uniform prior for {label} has invalid bounds [{lower}, {upper}]"
                    )));
                }
            }
            PriorShape::Gaussian { mean, sigma } => {
                if !mean.is_finite() || !sigma.is_finite() || sigma <= 0.0 {
                    return Err(PfError::Config(format!(
                        "gaussian prior for {label} needs finite mean and sigma > 0, got ({mean}, {sigma})"
                    )));
                }
            }
        }
        if let Some(domain) = self.domain {
            if !domain.lower.is_finite() || !domain.upper.is_finite() || domain.lower >= domain.upper {
                return Err(PfError::Config(format!(
                    "domain for {label} is invalid [{}, {}]",
                    domain.lower, domain.upper
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Prior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.shape {
            PriorShape::Fixed { value } => write!(f, "Fixed({value})"),
            PriorShape::Uniform { lower, upper } => write!(f, "Uniform({lower}, {upper})"),
            PriorShape::Gaussian { mean, sigma } => write!(f, "Gaussian({mean}, {sigma})"),
        }
    }
}
