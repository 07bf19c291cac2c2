//! Prior linking: deriving next-phase priors from completed results.

use serde::{Deserialize, Serialize};

use crate::errors::{BoundsError, PfResult};
use crate::model::ParamPath;
use crate::prior::{Domain, Prior};
use crate::result::{LinkSource, SourceParam};

/// How a past parameter becomes a prior of the next phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PriorLink {
    /// Fix the parameter at its best-fit value.
    AsFixed,
    /// Reuse the source distribution unchanged.
    AsFree,
    /// `Uniform(best - half_width, best + half_width)`.
    BoundedAbsolute { half_width: f64 },
    /// `Uniform` spanning `best` ± `fraction` of its magnitude.
    BoundedRelative { fraction: f64 },
    /// `Gaussian(best, sigma)`.
    GaussianAround { sigma: f64 },
}

/// Pure transformation from a source parameter to a new prior.
pub struct PriorLinker;

impl PriorLinker {
    /// Apply `mode` to `source`. `path` only labels errors.
    pub fn link(path: &ParamPath, source: &SourceParam, mode: PriorLink) -> PfResult<Prior> {
        let best = source.best;
        let domain = source.distribution.domain;
        match mode {
            PriorLink::AsFixed => Ok(Prior::fixed(best)),
            PriorLink::AsFree => Ok(source.distribution),
            PriorLink::BoundedAbsolute { half_width } => {
                if !half_width.is_finite() || half_width < 0.0 {
                    return Err(BoundsError::InvalidWidth {
                        path: path.to_string(),
                        value: half_width,
                    }
                    .into());
                }
                bounded(path, best - half_width, best + half_width, domain)
            }
            PriorLink::BoundedRelative { fraction } => {
                if !fraction.is_finite() || fraction < 0.0 {
                    return Err(BoundsError::InvalidWidth {
                        path: path.to_string(),
                        value: fraction,
                    }
                    .into());
                }
                let (lower, upper) = match domain {
                    Some(d) if d.is_positive() => (best * (1.0 - fraction), best * (1.0 + fraction)),
                    _ => (best - best.abs() * fraction, best + best.abs() * fraction),
                };
                bounded(path, lower, upper, domain)
            }
            PriorLink::GaussianAround { sigma } => {
                if !sigma.is_finite() || sigma <= 0.0 {
                    return Err(BoundsError::InvalidWidth {
                        path: path.to_string(),
                        value: sigma,
                    }
                    .into());
                }
                Ok(Prior::gaussian(best, sigma).with_optional_domain(domain))
            }
        }
    }
}

fn bounded(path: &ParamPath, lower: f64, upper: f64, domain: Option<Domain>) -> PfResult<Prior> {
    let (lower, upper) = match domain {
        Some(d) => (d.clamp(lower), d.clamp(upper)),
        None => (lower, upper),
    };
    if lower.is_nan() || upper.is_nan() || lower >= upper {
        return Err(BoundsError::EmptyRange {
            path: path.to_string(),
            lower,
            upper,
        }
        .into());
    }
    Ok(Prior::uniform(lower, upper).with_optional_domain(domain))
}

/// Which completed phase a rule reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    Named(String),
    /// The most recently completed phase.
    Last,
}

impl SourcePhase {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl std::fmt::Display for SourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourcePhase::Named(name) => f.write_str(name),
            SourcePhase::Last => f.write_str("<last>"),
        }
    }
}

/// What a rule links: one parameter, or every parameter of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum LinkTarget {
    Parameter { target: ParamPath, source: ParamPath },
    Component { target: String, source: String },
}

/// Declarative link: `target <- mode(phase.from.source)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRule {
    pub phase: SourcePhase,
    pub from: LinkSource,
    pub target: LinkTarget,
    pub mode: PriorLink,
}

impl LinkRule {
    /// Link a parameter onto the same path in the new model.
    pub fn param(
        phase: SourcePhase,
        from: LinkSource,
        path: ParamPath,
        mode: PriorLink,
    ) -> Self {
        Self {
            phase,
            from,
            target: LinkTarget::Parameter {
                target: path.clone(),
                source: path,
            },
            mode,
        }
    }

    /// Link a parameter onto a differently named target.
    pub fn param_to(
        phase: SourcePhase,
        from: LinkSource,
        source: ParamPath,
        target: ParamPath,
        mode: PriorLink,
    ) -> Self {
        Self {
            phase,
            from,
            target: LinkTarget::Parameter { target, source },
            mode,
        }
    }

    /// Link every parameter of a component onto the same-named component.
    pub fn component(
        phase: SourcePhase,
        from: LinkSource,
        component: impl Into<String>,
        mode: PriorLink,
    ) -> Self {
        let component = component.into();
        Self {
            phase,
            from,
            target: LinkTarget::Component {
                target: component.clone(),
                source: component,
            },
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PfError;

    fn path() -> ParamPath {
        ParamPath::new("subhalo", "kappa_s")
    }

    fn source(best: f64, distribution: Prior) -> SourceParam {
        SourceParam { distribution, best }
    }

    fn assert_uniform(prior: Prior, lower: f64, upper: f64) {
        let (l, u) = prior.uniform_bounds().expect("uniform prior");
        assert!((l - lower).abs() < 1e-12, "lower {l} != {lower}");
        assert!((u - upper).abs() < 1e-12, "upper {u} != {upper}");
    }

    #[test]
    fn bounded_relative_half_on_ten() {
        let src = source(10.0, Prior::gaussian(10.0, 1.0));
        let prior =
            PriorLinker::link(&path(), &src, PriorLink::BoundedRelative { fraction: 0.5 }).unwrap();
        assert_uniform(prior, 5.0, 15.0);
    }

    #[test]
    fn bounded_absolute_point_three_on_two() {
        let src = source(2.0, Prior::gaussian(2.0, 0.1));
        let prior =
            PriorLinker::link(&path(), &src, PriorLink::BoundedAbsolute { half_width: 0.3 })
                .unwrap();
        assert_uniform(prior, 1.7, 2.3);
    }

    #[test]
    fn bounded_relative_handles_negative_best() {
        let src = source(-4.0, Prior::uniform(-10.0, 10.0));
        let prior =
            PriorLinker::link(&path(), &src, PriorLink::BoundedRelative { fraction: 0.25 })
                .unwrap();
        assert_uniform(prior, -5.0, -3.0);
    }

    #[test]
    fn bounded_relative_on_positive_domain_stays_non_negative() {
        let positive = source(
            2.0,
            Prior::uniform(0.0, 10.0).with_optional_domain(Some(Domain::positive())),
        );
        let prior =
            PriorLinker::link(&path(), &positive, PriorLink::BoundedRelative { fraction: 1.5 })
                .unwrap();
        assert_uniform(prior, 0.0, 5.0);
        assert_eq!(prior.domain, Some(Domain::positive()));

        let unbounded = source(2.0, Prior::uniform(0.0, 10.0));
        let prior =
            PriorLinker::link(&path(), &unbounded, PriorLink::BoundedRelative { fraction: 1.5 })
                .unwrap();
        assert_uniform(prior, -1.0, 5.0);
    }

    #[test]
    fn bounded_links_clamp_to_domain() {
        let src = source(0.1, Prior::uniform(0.0, 1.0).with_domain(0.0, 1.0));
        let prior =
            PriorLinker::link(&path(), &src, PriorLink::BoundedAbsolute { half_width: 0.3 })
                .unwrap();
        assert_uniform(prior, 0.0, 0.4);
        assert_eq!(prior.domain, Some(Domain::new(0.0, 1.0)));
    }

    #[test]
    fn empty_or_inverted_ranges_fail() {
        let zero = source(0.0, Prior::uniform(-1.0, 1.0));
        let err = PriorLinker::link(&path(), &zero, PriorLink::BoundedRelative { fraction: 0.5 });
        assert!(matches!(err, Err(PfError::Bounds(BoundsError::EmptyRange { .. }))));

        // Entire range falls outside the domain and clamps to a single point.
        let outside = source(5.0, Prior::uniform(0.0, 10.0).with_domain(0.0, 1.0));
        let err =
            PriorLinker::link(&path(), &outside, PriorLink::BoundedAbsolute { half_width: 0.5 });
        assert!(matches!(err, Err(PfError::Bounds(_))));

        let negative = source(1.0, Prior::uniform(0.0, 2.0));
        let err =
            PriorLinker::link(&path(), &negative, PriorLink::BoundedAbsolute { half_width: -1.0 });
        assert!(matches!(err, Err(PfError::Bounds(BoundsError::InvalidWidth { .. }))));
    }

    #[test]
    fn fixed_and_free_links() {
        let src = source(1.0, Prior::gaussian(1.0, 0.2));
        assert_eq!(
            PriorLinker::link(&path(), &src, PriorLink::AsFree).unwrap(),
            Prior::gaussian(1.0, 0.2)
        );
        assert_eq!(
            PriorLinker::link(&path(), &src, PriorLink::AsFixed).unwrap(),
            Prior::fixed(1.0)
        );

        // The hard domain is not carried onto a fixed value.
        let bounded = source(0.4, Prior::uniform(0.0, 1.0).with_domain(0.0, 1.0));
        let fixed = PriorLinker::link(&path(), &bounded, PriorLink::AsFixed).unwrap();
        assert_eq!(fixed, Prior::fixed(0.4));
        assert!(fixed.domain.is_none());
    }

    #[test]
    fn gaussian_around_best() {
        let src = source(1.4, Prior::uniform(0.0, 3.0).with_domain(0.0, 3.0));
        let prior =
            PriorLinker::link(&path(), &src, PriorLink::GaussianAround { sigma: 0.3 }).unwrap();
        assert_eq!(prior, Prior::gaussian(1.4, 0.3).with_domain(0.0, 3.0));
        assert!(
            PriorLinker::link(&path(), &src, PriorLink::GaussianAround { sigma: 0.0 }).is_err()
        );
    }

    #[test]
    fn link_rule_serializes_with_explicit_source() {
        let rule = LinkRule::param(
            SourcePhase::named("phase_1"),
            LinkSource::HyperConstant,
            ParamPath::new("source", "coefficient"),
            PriorLink::AsFixed,
        );
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["from"], "hyper_constant");
        assert_eq!(json["mode"]["mode"], "as_fixed");
        let back: LinkRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }
}
