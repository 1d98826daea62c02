use rand::{Rng, RngCore};

use crate::{
    graph::{NodeId, NodeValues},
    math::{log_sum_exp, logaddexp},
    samplers::Blanket,
    specialize::{AlgorithmTemplate, RunError, RunOutcome, SamplerStats, Setup, SpecializeError, Specialized},
};

/// Whether a node is a Bernoulli variable: `dbern`, or `dbin` with a
/// constant size of one.
pub(crate) fn is_binary(graph: &crate::graph::ModelGraph, id: NodeId) -> bool {
    let Some(def) = graph.node(id).stochastic() else {
        return false;
    };
    match def.distribution.name() {
        "dbern" => true,
        "dbin" => def
            .distribution
            .params()
            .iter()
            .position(|p| p.name == "size")
            .and_then(|pos| def.params[pos].as_const())
            == Some(1.),
        _ => false,
    }
}

/// Exact Gibbs update of a scalar node that takes values in {0, 1}.
#[derive(Debug, Clone, Copy, Default)]
pub struct Binary;

struct BinarySampler {
    blanket: Blanket,
    target: NodeId,
    proposed: u64,
    accepted: u64,
}

impl AlgorithmTemplate for Binary {
    fn name(&self) -> &str {
        "binary"
    }

    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError> {
        let ids = setup.resolve_all(targets)?;
        let &[target] = ids.as_slice() else {
            return Err(SpecializeError::ShapeIncompatible {
                algorithm: self.name().to_string(),
                node: targets.join(", "),
                reason: "needs exactly one target node".to_string(),
            });
        };
        setup.require_sampleable(self.name(), target)?;
        setup.require_scalar(self.name(), target)?;
        if !is_binary(setup.graph(), target) {
            return Err(SpecializeError::ShapeIncompatible {
                algorithm: self.name().to_string(),
                node: targets[0].clone(),
                reason: "needs a dbern node or a dbin node of size 1".to_string(),
            });
        }
        Ok(Box::new(BinarySampler {
            blanket: Blanket::new(setup, ids),
            target,
            proposed: 0,
            accepted: 0,
        }))
    }
}

impl Specialized for BinarySampler {
    fn name(&self) -> &str {
        "binary"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        self.proposed += 1;
        let range = self.blanket.graph.node(self.target).range();
        let current_logp = self.blanket.cached(values);
        self.blanket.save(values);
        let current = values.slice(range.clone())[0];
        values.slice_mut(range)[0] = if current == 0. { 1. } else { 0. };
        let other_logp = self.blanket.calculate(values);

        // Probability of the other value given the blanket.
        let jump = (other_logp - logaddexp(current_logp, other_logp)).exp();
        if rng.random::<f64>() < jump {
            self.accepted += 1;
            Ok(RunOutcome::Accepted)
        } else {
            self.blanket.restore(values);
            Ok(RunOutcome::Rejected)
        }
    }

    fn stats(&self) -> SamplerStats {
        SamplerStats::new(self.proposed, self.accepted, None)
    }

    fn reset(&mut self) {
        self.proposed = 0;
        self.accepted = 0;
    }
}

/// Exact Gibbs update of a `dcat` node over `1..=k`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Categorical;

struct CategoricalSampler {
    blanket: Blanket,
    target: NodeId,
    logp: Vec<f64>,
    proposed: u64,
    accepted: u64,
}

impl AlgorithmTemplate for Categorical {
    fn name(&self) -> &str {
        "categorical"
    }

    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError> {
        let ids = setup.resolve_all(targets)?;
        let &[target] = ids.as_slice() else {
            return Err(SpecializeError::ShapeIncompatible {
                algorithm: self.name().to_string(),
                node: targets.join(", "),
                reason: "needs exactly one target node".to_string(),
            });
        };
        setup.require_sampleable(self.name(), target)?;
        setup.require_scalar(self.name(), target)?;
        let node = setup.graph().node(target);
        let k = match node.stochastic() {
            Some(def) if def.distribution.name() == "dcat" => def.param_shapes[0].len(),
            _ => {
                return Err(SpecializeError::ShapeIncompatible {
                    algorithm: self.name().to_string(),
                    node: node.name.clone(),
                    reason: "needs a dcat node".to_string(),
                })
            }
        };
        Ok(Box::new(CategoricalSampler {
            blanket: Blanket::new(setup, ids),
            target,
            logp: vec![0.; k],
            proposed: 0,
            accepted: 0,
        }))
    }
}

impl Specialized for CategoricalSampler {
    fn name(&self) -> &str {
        "categorical"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        self.proposed += 1;
        let range = self.blanket.graph.node(self.target).range();
        self.blanket.save(values);
        for (i, logp) in self.logp.iter_mut().enumerate() {
            values.slice_mut(range.clone())[0] = (i + 1) as f64;
            *logp = self.blanket.calculate(values);
        }
        let total = log_sum_exp(&self.logp);
        if !total.is_finite() {
            self.blanket.restore(values);
            log::trace!("every category has zero probability, keeping the current value");
            return Ok(RunOutcome::Rejected);
        }

        let u = rng.random::<f64>();
        let mut cumulative = 0.;
        let mut chosen = self.logp.len();
        for (i, logp) in self.logp.iter().enumerate() {
            cumulative += (logp - total).exp();
            if u < cumulative {
                chosen = i + 1;
                break;
            }
        }
        // Rounding can leave the cumulative sum just short of one.
        while chosen > 1 && self.logp[chosen - 1] == f64::NEG_INFINITY {
            chosen -= 1;
        }
        values.slice_mut(range)[0] = chosen as f64;
        self.blanket.calculate(values);
        self.accepted += 1;
        Ok(RunOutcome::Updated)
    }

    fn stats(&self) -> SamplerStats {
        SamplerStats::new(self.proposed, self.accepted, None)
    }

    fn reset(&mut self) {
        self.proposed = 0;
        self.accepted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expr::node,
        graph::Relation,
        samplers::test_util::{build, draws, instance, mean},
        shape::Shape,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn binary_prior_frequency() {
        let graph = build(vec![Relation::stochastic(
            "z",
            Shape::scalar(),
            "dbern",
            [("prob", 0.3.into())],
        )]);
        let mut sampler = instance(&graph, &Binary, &["z"]);
        let mut values = graph.new_values();
        let draws = draws(&graph, &mut values, sampler.as_mut(), "z", 20_000, 1);
        assert!(draws.iter().all(|&z| z == 0. || z == 1.));
        assert_abs_diff_eq!(mean(&draws), 0.3, epsilon = 0.02);
    }

    #[test]
    fn binary_posterior_with_data() {
        // z ~ dbern(0.5), y ~ N(2 z, 1) with y = 2 gives P(z = 1) = 1 / (1 + e^-2)
        let graph = build(vec![
            Relation::stochastic("z", Shape::scalar(), "dbin", [("prob", 0.5.into()), ("size", 1.0.into())]),
            Relation::stochastic("y", Shape::scalar(), "dnorm", [("mean", node("z") * 2.), ("sd", 1.0.into())])
                .observed(vec![2.]),
        ]);
        let mut sampler = instance(&graph, &Binary, &["z"]);
        let mut values = graph.new_values();
        let draws = draws(&graph, &mut values, sampler.as_mut(), "z", 20_000, 2);
        assert_abs_diff_eq!(mean(&draws), 1. / (1. + (-2f64).exp()), epsilon = 0.02);
    }

    #[test]
    fn binary_rejects_other_distributions() {
        let graph = build(vec![
            Relation::stochastic("n", Shape::scalar(), "dbin", [("prob", 0.5.into()), ("size", 3.0.into())]),
            Relation::stochastic("k", Shape::scalar(), "dpois", [("lambda", 1.0.into())]),
        ]);
        assert!(!is_binary(&graph, graph.node_id("n").unwrap()));
        let mut setup = Setup::new(graph);
        for target in ["n", "k"] {
            assert!(setup.specialize(&Binary, &[target.to_string()]).is_err());
        }
    }

    #[test]
    fn categorical_frequencies() {
        let graph = build(vec![Relation::stochastic(
            "c",
            Shape::scalar(),
            "dcat",
            [("prob", vec![1., 2., 0., 1.].into())],
        )]);
        let mut sampler = instance(&graph, &Categorical, &["c"]);
        let mut values = graph.new_values();
        let draws = draws(&graph, &mut values, sampler.as_mut(), "c", 20_000, 3);
        let freq = |k: f64| draws.iter().filter(|&&c| c == k).count() as f64 / draws.len() as f64;
        assert_eq!(freq(3.), 0.);
        assert_abs_diff_eq!(freq(1.), 0.25, epsilon = 0.02);
        assert_abs_diff_eq!(freq(2.), 0.5, epsilon = 0.02);
        assert_eq!(sampler.stats().proposed, 20_000);
    }
}
