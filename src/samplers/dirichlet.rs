use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

use crate::{
    deps::DependencySet,
    graph::{NodeId, NodeValues},
    samplers::{accept, Blanket, RandomWalkSettings, ScaleAdapter},
    specialize::{AlgorithmTemplate, RunError, RunOutcome, SamplerStats, Setup, SpecializeError, Specialized},
};

/// Random walk for a `ddirch` node on its unnormalized gamma representation.
///
/// The node value is `theta / sum(theta)` with independent
/// `theta[i] ~ Gamma(alpha[i], 1)`. Each run proposes a log-scale step for
/// every component of `theta` in turn, so the value never leaves the
/// simplex. Every component adapts its own scale.
#[derive(Debug, Clone, Default)]
pub struct RandomWalkDirichlet {
    pub settings: RandomWalkSettings,
}

impl RandomWalkDirichlet {
    pub fn new(settings: RandomWalkSettings) -> Self {
        RandomWalkDirichlet { settings }
    }
}

struct DirichletSampler {
    blanket: Blanket,
    target: NodeId,
    /// Markov blanket without the target's own density.
    dependents: DependencySet,
    theta: Vec<f64>,
    alpha: Vec<f64>,
    adapters: Vec<ScaleAdapter>,
}

impl AlgorithmTemplate for RandomWalkDirichlet {
    fn name(&self) -> &str {
        "RW_dirichlet"
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
        setup.require_vector(self.name(), target)?;
        let node = setup.graph().node(target);
        if !node.distribution().is_some_and(|d| d.name() == "ddirch") {
            return Err(SpecializeError::ShapeIncompatible {
                algorithm: self.name().to_string(),
                node: node.name.clone(),
                reason: "needs a ddirch node".to_string(),
            });
        }
        let k = node.shape.len();
        let blanket = Blanket::new(setup, ids);
        let dependents = blanket.calc.filter(|id| id != target);
        let adapter = ScaleAdapter::new(self.settings.scale, 0.44, self.settings.adapt_interval, self.settings.adaptive);
        Ok(Box::new(DirichletSampler {
            blanket,
            target,
            dependents,
            theta: vec![0.; k],
            alpha: vec![0.; k],
            adapters: vec![adapter; k],
        }))
    }
}

impl DirichletSampler {
    /// Restart from the current value when another update moved the node.
    fn sync(&mut self, current: &[f64]) {
        let total: f64 = self.theta.iter().sum();
        let stale = !(total > 0.)
            || self
                .theta
                .iter()
                .zip(current)
                .any(|(t, x)| (t / total - x).abs() > 1e-12);
        if stale {
            self.theta.copy_from_slice(current);
        }
    }
}

impl Specialized for DirichletSampler {
    fn name(&self) -> &str {
        "RW_dirichlet"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        let graph = self.blanket.graph.clone();
        let range = graph.node(self.target).range();
        self.alpha
            .copy_from_slice(graph.param_values(values, self.target)[0]);
        self.sync(values.slice(range.clone()));

        let mut any_accepted = false;
        for i in 0..self.theta.len() {
            self.blanket.save(values);
            let step: f64 = rng.sample::<f64, _>(StandardNormal) * self.adapters[i].scale();
            let current = self.theta[i];
            let proposal = current * step.exp();
            self.theta[i] = proposal;
            let total: f64 = self.theta.iter().sum();
            for (x, t) in values.slice_mut(range.clone()).iter_mut().zip(&self.theta) {
                *x = t / total;
            }

            // Gamma(alpha, 1) prior on theta[i] plus the log-scale Jacobian.
            let log_correction = self.alpha[i] * step - proposal + current;
            let log_ratio = graph.calculate_diff(values, &self.dependents) + log_correction;
            let accepted = accept(log_ratio, rng);
            if accepted {
                graph.node_log_prob(values, self.target);
                any_accepted = true;
            } else {
                self.theta[i] = current;
                self.blanket.restore(values);
            }
            self.adapters[i].record(accepted);
        }
        Ok(if any_accepted {
            RunOutcome::Accepted
        } else {
            RunOutcome::Rejected
        })
    }

    fn stats(&self) -> SamplerStats {
        let proposed = self.adapters.iter().map(|a| a.stats().proposed).sum();
        let accepted = self.adapters.iter().map(|a| a.stats().accepted).sum();
        let scale = self.adapters.iter().map(ScaleAdapter::scale).sum::<f64>() / self.adapters.len() as f64;
        SamplerStats::new(proposed, accepted, Some(scale))
    }

    fn reset(&mut self) {
        self.adapters.iter_mut().for_each(ScaleAdapter::reset);
        self.theta.iter_mut().for_each(|t| *t = 0.);
    }
}
