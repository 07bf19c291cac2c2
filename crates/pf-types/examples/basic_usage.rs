use pf_types::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("phasefit basic usage");

    // A first-phase model: isothermal lens, sersic source
    let model = Model::builder()
        .component("lens", "isothermal")
        .param("einstein_radius", Prior::uniform(0.5, 2.5).with_domain(0.0, 10.0))
        .param("axis_ratio", Prior::gaussian(0.8, 0.1).with_domain(0.2, 1.0))
        .component("source", "sersic")
        .param("effective_radius", Prior::uniform(0.05, 1.0))
        .build()?;
    println!("Model has {} free parameters", model.free_parameter_count());

    // Pretend an optimizer returned this posterior
    let variable = model.clone();
    let constant = model.fixed_at(|_, prior| prior.centre());
    let result = FitResult::new(constant, variable, -1532.4);
    result.validate()?;

    // Derive priors for the next phase
    let radius = ParamPath::new("lens", "einstein_radius");
    let source = result.source_param(LinkSource::Variable, &radius, "phase_1")?;
    for mode in [
        PriorLink::AsFixed,
        PriorLink::AsFree,
        PriorLink::BoundedAbsolute { half_width: 0.3 },
        PriorLink::BoundedRelative { fraction: 0.5 },
        PriorLink::GaussianAround { sigma: 0.2 },
    ] {
        let prior = PriorLinker::link(&radius, &source, mode)?;
        println!("{radius} via {mode:?} -> {prior}");
    }

    for row in result.summary().parameters {
        println!("{}: {:.3} ± {:.3}", row.path, row.best, row.uncertainty);
    }

    Ok(())
}
