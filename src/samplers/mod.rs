//! Built-in MCMC samplers. Each is an `AlgorithmTemplate`; setup checks the
//! target and precomputes its Markov blanket, run performs one update.

mod conjugate;
mod dirichlet;
mod discrete;
mod predictive;
mod rw;
mod slice;

use std::sync::Arc;

use rand::{Rng, RngCore};

use crate::{
    deps::DependencySet,
    distribution::Support,
    graph::{ModelGraph, NodeId, NodeValues},
    specialize::{Scratch, Setup},
};

pub use conjugate::{Conjugacy, Conjugate};
pub use dirichlet::RandomWalkDirichlet;
pub use discrete::{Binary, Categorical};
pub(crate) use discrete::is_binary;
pub use predictive::PosteriorPredictive;
pub use rw::{RandomWalk, RandomWalkBlock, RandomWalkSettings, ScaleAdapter};
pub use slice::{Slice, SliceSettings};

/// Metropolis-Hastings acceptance. `-inf` and NaN ratios always reject.
pub(crate) fn accept(log_ratio: f64, rng: &mut dyn RngCore) -> bool {
    if log_ratio.is_nan() || log_ratio == f64::NEG_INFINITY {
        return false;
    }
    log_ratio >= 0. || rng.random::<f64>().ln() < log_ratio
}

/// Targets plus the node set a sampler recalculates after changing them,
/// and the scratch copy used to undo a rejected proposal.
pub(crate) struct Blanket {
    pub graph: Arc<ModelGraph>,
    pub targets: Vec<NodeId>,
    pub calc: DependencySet,
    scratch: Scratch,
}

impl Blanket {
    pub fn new(setup: &Setup, targets: Vec<NodeId>) -> Self {
        let calc = setup.calc_nodes(&targets);
        let scratch = setup.scratch(&calc);
        Blanket {
            graph: setup.graph().clone(),
            targets,
            calc,
            scratch,
        }
    }

    pub fn save(&mut self, values: &NodeValues) {
        self.scratch.save(values);
    }

    pub fn restore(&self, values: &mut NodeValues) {
        self.scratch.restore(values);
    }

    pub fn calculate(&self, values: &mut NodeValues) -> f64 {
        self.graph.calculate(values, &self.calc)
    }

    /// Cached log-probability of the blanket.
    pub fn cached(&self, values: &NodeValues) -> f64 {
        self.graph.get_log_prob(values, &self.calc)
    }

    /// Accept or reject a proposal already written into the targets. On
    /// rejection every value and cache of the blanket is restored.
    pub fn decide(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore, log_correction: f64) -> bool {
        let log_ratio = self.graph.calculate_diff(values, &self.calc) + log_correction;
        let accepted = accept(log_ratio, rng);
        if !accepted {
            self.restore(values);
        }
        accepted
    }
}

/// Support of a node at the parameter values implied by a fresh value set.
pub(crate) fn initial_support(graph: &ModelGraph, id: NodeId) -> Option<Support> {
    let dist = graph.node(id).distribution()?.clone();
    let mut values = graph.new_values();
    let params = graph.param_values(&mut values, id);
    Some(dist.support(&params))
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use rand::{rngs::StdRng, SeedableRng};

    use crate::{
        graph::{ModelGraph, NodeValues, Relation},
        registry::Registry,
        specialize::{AlgorithmTemplate, Setup, Specialized},
    };

    pub fn build(relations: Vec<Relation>) -> Arc<ModelGraph> {
        Arc::new(ModelGraph::build(relations, &Registry::with_builtins()).unwrap())
    }

    pub fn instance(
        graph: &Arc<ModelGraph>,
        template: &dyn AlgorithmTemplate,
        targets: &[&str],
    ) -> Box<dyn Specialized> {
        let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        Setup::new(graph.clone()).specialize(template, &targets).unwrap()
    }

    /// Run `instance` `n` times from values whose caches are current and
    /// return the draws of node `name`.
    pub fn draws(
        graph: &ModelGraph,
        values: &mut NodeValues,
        instance: &mut dyn Specialized,
        name: &str,
        n: usize,
        seed: u64,
    ) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let all: Vec<_> = (0..graph.len()).map(crate::graph::NodeId).collect();
        let set = graph.get_dependencies(&all, &Default::default());
        graph.calculate(values, &set);
        let id = graph.node_id(name).unwrap();
        (0..n)
            .map(|_| {
                instance.run(values, &mut rng).unwrap();
                values.get(graph.node(id))[0]
            })
            .collect()
    }

    pub fn mean(draws: &[f64]) -> f64 {
        draws.iter().sum::<f64>() / draws.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn never_accept_neg_infinity() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            assert!(!accept(f64::NEG_INFINITY, &mut rng));
            assert!(!accept(f64::NAN, &mut rng));
            assert!(accept(0., &mut rng));
            assert!(accept(f64::INFINITY, &mut rng));
        }
        let accepted = (0..10_000).filter(|_| accept(0.5f64.ln(), &mut rng)).count();
        assert!((4_500..5_500).contains(&accepted));
    }
}
