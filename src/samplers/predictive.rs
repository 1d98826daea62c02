use rand::RngCore;

use crate::{
    graph::{NodeId, NodeValues},
    samplers::Blanket,
    specialize::{AlgorithmTemplate, RunError, RunOutcome, SamplerStats, Setup, SpecializeError, Specialized},
};

/// Draws a node that nothing depends on stochastically directly from its
/// distribution given its parents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosteriorPredictive;

struct PredictiveSampler {
    blanket: Blanket,
    draws: u64,
}

impl AlgorithmTemplate for PosteriorPredictive {
    fn name(&self) -> &str {
        "posterior_predictive"
    }

    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError> {
        let ids = setup.resolve_all(targets)?;
        for &id in ids.iter() {
            setup.require_sampleable(self.name(), id)?;
            let dependents = setup.graph().stochastic_dependents(id);
            if let Some(&dep) = dependents.iter().find(|dep| !ids.contains(dep)) {
                return Err(SpecializeError::ShapeIncompatible {
                    algorithm: self.name().to_string(),
                    node: setup.graph().node(id).name.clone(),
                    reason: format!(
                        "node '{}' depends on it stochastically",
                        setup.graph().node(dep).name
                    ),
                });
            }
        }
        Ok(Box::new(PredictiveSampler {
            blanket: Blanket::new(setup, ids),
            draws: 0,
        }))
    }
}

impl Specialized for PredictiveSampler {
    fn name(&self) -> &str {
        "posterior_predictive"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        let targets = &self.blanket.targets;
        self.blanket
            .graph
            .simulate_set(values, &self.blanket.calc, |id| targets.contains(&id), false, rng);
        self.blanket.calculate(values);
        self.draws += 1;
        Ok(RunOutcome::Updated)
    }

    fn stats(&self) -> SamplerStats {
        SamplerStats::new(self.draws, self.draws, None)
    }

    fn reset(&mut self) {
        self.draws = 0;
    }
}
