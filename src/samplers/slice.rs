use rand::{Rng, RngCore};
use rand_distr::Exp1;

use crate::{
    distribution::Family,
    graph::{NodeId, NodeValues},
    samplers::Blanket,
    specialize::{AlgorithmTemplate, RunError, RunOutcome, SamplerStats, Setup, SpecializeError, Specialized},
};

/// Settings for the univariate slice sampler.
#[derive(Debug, Clone, Copy)]
pub struct SliceSettings {
    /// Initial width of the stepping-out interval.
    pub width: f64,
    pub adaptive: bool,
    /// Number of updates between width adaptations.
    pub adapt_interval: u64,
    /// Maximum number of steps out in each direction.
    pub max_steps_out: usize,
}

impl Default for SliceSettings {
    fn default() -> Self {
        Self {
            width: 1.,
            adaptive: true,
            adapt_interval: 200,
            max_steps_out: 100,
        }
    }
}

/// Stepping-out slice sampler for a scalar node. Discrete nodes are
/// embedded in the real line by flooring.
#[derive(Debug, Clone, Default)]
pub struct Slice {
    pub settings: SliceSettings,
}

impl Slice {
    pub fn new(settings: SliceSettings) -> Self {
        Slice { settings }
    }
}

const MAX_SHRINK: usize = 1000;

struct SliceSampler {
    blanket: Blanket,
    target: NodeId,
    discrete: bool,
    settings: SliceSettings,
    width: f64,
    times_adapted: u64,
    window: u64,
    sum_jumps: f64,
    proposed: u64,
    accepted: u64,
}

impl AlgorithmTemplate for Slice {
    fn name(&self) -> &str {
        "slice"
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
        let discrete = setup.graph().node(target).family() == Some(Family::Discrete);
        Ok(Box::new(SliceSampler {
            blanket: Blanket::new(setup, ids),
            target,
            discrete,
            settings: self.settings,
            width: self.settings.width,
            times_adapted: 0,
            window: 0,
            sum_jumps: 0.,
            proposed: 0,
            accepted: 0,
        }))
    }
}

impl SliceSampler {
    /// Log-probability of the blanket with the target set to `x`.
    fn eval(&self, values: &mut NodeValues, x: f64) -> f64 {
        let range = self.blanket.graph.node(self.target).range();
        values.slice_mut(range)[0] = if self.discrete { x.floor() } else { x };
        let logp = self.blanket.calculate(values);
        if logp.is_nan() {
            f64::NEG_INFINITY
        } else {
            logp
        }
    }

    fn adapt(&mut self, jump: f64) {
        if !self.settings.adaptive {
            return;
        }
        self.sum_jumps += jump.abs();
        self.window += 1;
        if self.window < self.settings.adapt_interval.max(1) {
            return;
        }
        self.times_adapted += 1;
        let gamma = 1. / ((self.times_adapted + 3) as f64).powf(0.8);
        let mean_jump = self.sum_jumps / self.window as f64;
        self.width += (2. * mean_jump - self.width) * gamma;
        // A chain that never moved would otherwise collapse the width.
        if self.width <= 0. || !self.width.is_finite() {
            self.width = self.settings.width;
        }
        self.window = 0;
        self.sum_jumps = 0.;
        log::trace!("slice width now {:.4}", self.width);
    }
}

impl Specialized for SliceSampler {
    fn name(&self) -> &str {
        "slice"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        self.proposed += 1;
        self.blanket.save(values);
        let current = self.blanket.cached(values);
        let value = values.get(self.blanket.graph.node(self.target))[0];
        if !current.is_finite() {
            return Ok(RunOutcome::Rejected);
        }
        let x0 = if self.discrete {
            value + rng.random::<f64>()
        } else {
            value
        };
        let height = current - rng.sample::<f64, _>(Exp1);

        let mut left = x0 - self.width * rng.random::<f64>();
        let mut right = left + self.width;
        let mut steps = 0;
        while steps < self.settings.max_steps_out && self.eval(values, left) > height {
            left -= self.width;
            steps += 1;
        }
        steps = 0;
        while steps < self.settings.max_steps_out && self.eval(values, right) > height {
            right += self.width;
            steps += 1;
        }

        for _ in 0..MAX_SHRINK {
            let x1 = left + rng.random::<f64>() * (right - left);
            if self.eval(values, x1) >= height {
                self.accepted += 1;
                let jump = if self.discrete { x1.floor() - value } else { x1 - x0 };
                self.adapt(jump);
                return Ok(RunOutcome::Accepted);
            }
            if x1 < x0 {
                left = x1;
            } else {
                right = x1;
            }
        }
        self.blanket.restore(values);
        log::trace!("slice shrinkage exhausted, keeping the current value");
        Ok(RunOutcome::Rejected)
    }

    fn stats(&self) -> SamplerStats {
        SamplerStats::new(self.proposed, self.accepted, Some(self.width))
    }

    fn reset(&mut self) {
        self.width = self.settings.width;
        self.times_adapted = 0;
        self.window = 0;
        self.sum_jumps = 0.;
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
        math::is_integer,
        samplers::test_util::{build, draws, instance, mean},
        shape::Shape,
    };
    use approx::assert_abs_diff_eq;

    #[test]
    fn continuous_gamma_mean() {
        let graph = build(vec![Relation::stochastic(
            "x",
            Shape::scalar(),
            "dgamma",
            [("shape", 3.0.into()), ("rate", 2.0.into())],
        )]);
        let mut values = graph.new_values();
        values.get_mut(graph.node(graph.node_id("x").unwrap())).copy_from_slice(&[1.]);
        let mut sampler = instance(&graph, &Slice::default(), &["x"]);
        let draws = draws(&graph, &mut values, sampler.as_mut(), "x", 20_000, 11);
        assert!(draws.iter().all(|&x| x > 0.));
        assert_abs_diff_eq!(mean(&draws[1_000..]), 1.5, epsilon = 0.08);
        let stats = sampler.stats();
        assert_eq!(stats.proposed, 20_000);
        assert!(stats.scale.unwrap() > 0.);
    }

    #[test]
    fn discrete_values_stay_integer() {
        let graph = build(vec![
            Relation::stochastic("k", Shape::scalar(), "dpois", [("lambda", 4.0.into())]),
            Relation::stochastic("y", Shape::scalar(), "dpois", [("lambda", node("k") + 1.)]).observed(vec![5.]),
        ]);
        let mut values = graph.new_values();
        values.get_mut(graph.node(graph.node_id("k").unwrap())).copy_from_slice(&[2.]);
        let mut sampler = instance(&graph, &Slice::default(), &["k"]);
        let draws = draws(&graph, &mut values, sampler.as_mut(), "k", 5_000, 5);
        assert!(draws.iter().all(|&k| is_integer(k) && k >= 0.));
        assert!(draws.iter().any(|&k| k != 2.));
    }

    #[test]
    fn requires_a_scalar_stochastic_target() {
        let graph = build(vec![
            Relation::stochastic("v", Shape::vector(2), "ddirch", [("alpha", vec![1., 1.].into())]),
            Relation::deterministic("d", Shape::vector(2), node("v") * 2.),
        ]);
        let mut setup = Setup::new(graph);
        for target in ["v", "d"] {
            assert!(matches!(
                setup.specialize(&Slice::default(), &[target.to_string()]),
                Err(SpecializeError::ShapeIncompatible { .. })
            ));
        }
    }
}
