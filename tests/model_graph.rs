use std::sync::Arc;

use anyhow::Result;
use approx::assert_abs_diff_eq;
use graphmc::{
    expr::{call, node, Kernel},
    DependencyOptions, DistributionDescriptor, GraphError, LogProbTemplate, Model, ModelGraph, Parameterization,
    Registry, Relation, RunOutcome, Setup, Shape, Support,
};
use pretty_assertions::assert_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn exponential() -> DistributionDescriptor {
    DistributionDescriptor::new()
        .density(["rate"], |x, p| {
            let rate = p[0][0];
            rate.ln() - x[0] * rate
        })
        .sampler(["rate"], |p, rng, out| {
            let u: f64 = rng.random();
            out[0] = -(1. - u).ln() / p[0][0];
        })
        .alternate(
            Parameterization::new(["scale"])
                .canonical("rate", 1. / node("scale"))
                .reports("scale", 1. / node("rate")),
        )
        .support(Support::non_negative())
}

#[test]
fn exponential_with_scale() -> Result<()> {
    let registry = Registry::new();
    registry.register("my_exp", exponential())?;

    let mut model = Model::build(
        [Relation::stochastic("x", Shape::scalar(), "my_exp", [("scale", 2.0.into())])],
        &registry,
    )?;
    assert_eq!(model.param("x", "rate")?, vec![0.5]);
    assert_eq!(model.param("x", "scale")?, vec![2.]);

    let mut rng = StdRng::seed_from_u64(0);
    model.simulate(&["x"], &mut rng)?;
    let x = model.value("x")?[0];
    assert!(x.is_finite() && x >= 0.);

    let logp = model.calculate_log_prob(&["x"])?;
    assert_abs_diff_eq!(logp, 0.5f64.ln() - x * 0.5, epsilon = 1e-12);

    model.set_value("x", &[-1.])?;
    assert_eq!(model.calculate_log_prob(&["x"])?, f64::NEG_INFINITY);
    Ok(())
}

fn logistic() -> Vec<Relation> {
    vec![
        Relation::constant("x", Shape::scalar(), vec![0.7]),
        Relation::stochastic("b0", Shape::scalar(), "dnorm", [("mean", 0.0.into()), ("sd", 1.0.into())]),
        Relation::stochastic("b1", Shape::scalar(), "dnorm", [("mean", 0.0.into()), ("sd", 1.0.into())]),
        Relation::deterministic("p", Shape::scalar(), call(Kernel::Expit, [node("b0") + node("b1") * node("x")])),
        Relation::stochastic("y", Shape::scalar(), "dbern", [("prob", node("p"))]).observed(vec![1.]),
    ]
}

#[test]
fn log_prob_of_y_given_coefficients() -> Result<()> {
    let mut model = Model::build(logistic(), &Registry::with_builtins())?;
    let deps = model.get_dependencies(&["y"], &DependencyOptions::default())?;
    let names = model.graph().names_of(deps.ids());
    assert_eq!(names, vec!["x", "b0", "b1", "p", "y"]);

    model.set_value("b0", &[0.2])?;
    model.set_value("b1", &[-0.4])?;
    let graph = model.graph().clone();
    let mut setup = Setup::new(graph.clone());
    let mut instance = setup.specialize(&LogProbTemplate::default(), &["y".to_string()])?;
    let mut rng = StdRng::seed_from_u64(1);
    let outcome = instance.run(model.values_mut(), &mut rng)?;

    let p = 1. / (1. + (-(0.2 - 0.4 * 0.7f64)).exp());
    assert_eq!(model.value("p")?.len(), 1);
    assert_abs_diff_eq!(model.value("p")?[0], p, epsilon = 1e-12);
    let RunOutcome::Value(logp) = outcome else {
        panic!("log_prob returned {:?}", outcome);
    };
    assert_abs_diff_eq!(logp, p.ln(), epsilon = 1e-12);
    Ok(())
}

#[test]
fn cycles_are_rejected() {
    let relations = vec![
        Relation::deterministic("a", Shape::scalar(), node("b") + 1.),
        Relation::deterministic("b", Shape::scalar(), node("a") * 2.),
    ];
    let err = ModelGraph::build(relations, &Registry::new()).err();
    assert!(matches!(err, Some(GraphError::CyclicDependency { .. })));

    let relations = vec![Relation::stochastic(
        "a",
        Shape::scalar(),
        "dnorm",
        [("mean", node("a")), ("sd", 1.0.into())],
    )];
    let err = ModelGraph::build(relations, &Registry::with_builtins()).err();
    assert!(matches!(err, Some(GraphError::CyclicDependency { .. })));
}

#[test]
fn simulation_is_reproducible() -> Result<()> {
    let graph = Arc::new(ModelGraph::build(logistic(), &Registry::with_builtins())?);
    let run = |seed: u64| -> Result<(Vec<f64>, f64)> {
        let mut model = Model::new(graph.clone());
        let mut rng = StdRng::seed_from_u64(seed);
        model.simulate(&["b0", "b1"], &mut rng)?;
        let logp = model.calculate_log_prob(&["b0", "b1", "y"])?;
        Ok((model.values().as_slice().to_vec(), logp))
    };
    let (first, logp_first) = run(7)?;
    let (second, logp_second) = run(7)?;
    assert_eq!(first, second);
    assert_eq!(logp_first, logp_second);
    let (other, _) = run(8)?;
    assert!(first != other);
    Ok(())
}

#[test]
fn out_of_support_is_negative_infinity() -> Result<()> {
    let registry = Registry::with_builtins();
    let mut model = Model::build(
        [
            Relation::stochastic("p", Shape::scalar(), "dbeta", [("shape1", 2.0.into()), ("shape2", 2.0.into())]),
            Relation::stochastic("k", Shape::scalar(), "dpois", [("lambda", 3.0.into())]),
            Relation::stochastic("s", Shape::scalar(), "dgamma", [("shape", 2.0.into()), ("scale", 1.0.into())]),
        ],
        &registry,
    )?;
    for (name, value) in [("p", 1.5), ("k", 2.5), ("k", -1.), ("s", -0.1)] {
        model.set_value(name, &[value])?;
        assert_eq!(model.calculate_log_prob(&[name])?, f64::NEG_INFINITY);
    }
    assert_eq!(model.param("s", "rate")?, vec![1.]);
    Ok(())
}
