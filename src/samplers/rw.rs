use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

use crate::{
    distribution::Family,
    graph::{NodeId, NodeValues},
    samplers::{initial_support, Blanket},
    specialize::{AlgorithmTemplate, RunError, RunOutcome, SamplerStats, Setup, SpecializeError, Specialized},
};

/// Settings for random walk Metropolis samplers.
#[derive(Debug, Clone, Copy)]
pub struct RandomWalkSettings {
    /// Initial standard deviation of the normal proposal.
    pub scale: f64,
    pub adaptive: bool,
    /// Number of proposals between adaptations.
    pub adapt_interval: u64,
    /// Propose on the log scale. Only for targets with non-negative support.
    pub log_scale: bool,
    /// Reflect proposals off the bounds of the support.
    pub reflective: bool,
}

impl Default for RandomWalkSettings {
    fn default() -> Self {
        RandomWalkSettings {
            scale: 1.,
            adaptive: true,
            adapt_interval: 200,
            log_scale: false,
            reflective: false,
        }
    }
}

/// Adapts a proposal scale towards a target acceptance rate.
///
/// Every `interval` proposals the scale is multiplied by
/// `exp(10 * gamma * (rate - target))` with `gamma = (times_adapted + 3)^-0.8`,
/// so adaptation diminishes over time.
#[derive(Debug, Clone)]
pub struct ScaleAdapter {
    scale: f64,
    initial_scale: f64,
    target: f64,
    interval: u64,
    enabled: bool,
    times_adapted: u64,
    window_proposed: u64,
    window_accepted: u64,
    proposed: u64,
    accepted: u64,
}

impl ScaleAdapter {
    pub fn new(scale: f64, target: f64, interval: u64, enabled: bool) -> Self {
        ScaleAdapter {
            scale,
            initial_scale: scale,
            target,
            interval: interval.max(1),
            enabled,
            times_adapted: 0,
            window_proposed: 0,
            window_accepted: 0,
            proposed: 0,
            accepted: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn times_adapted(&self) -> u64 {
        self.times_adapted
    }

    pub fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        self.window_proposed += 1;
        if accepted {
            self.accepted += 1;
            self.window_accepted += 1;
        }
        if !self.enabled || self.window_proposed < self.interval {
            return;
        }
        let rate = self.window_accepted as f64 / self.window_proposed as f64;
        self.times_adapted += 1;
        let gamma = 1. / ((self.times_adapted + 3) as f64).powf(0.8);
        self.scale *= (10. * gamma * (rate - self.target)).exp();
        self.window_proposed = 0;
        self.window_accepted = 0;
        log::trace!(
            "acceptance rate {:.3}, proposal scale now {:.4}",
            rate,
            self.scale
        );
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats::new(self.proposed, self.accepted, Some(self.scale))
    }

    pub fn reset(&mut self) {
        *self = ScaleAdapter::new(self.initial_scale, self.target, self.interval, self.enabled);
    }
}

/// Adaptive random walk Metropolis for a scalar continuous node.
#[derive(Debug, Clone, Default)]
pub struct RandomWalk {
    pub settings: RandomWalkSettings,
}

impl RandomWalk {
    pub fn new(settings: RandomWalkSettings) -> Self {
        RandomWalk { settings }
    }
}

struct RandomWalkSampler {
    blanket: Blanket,
    target: NodeId,
    settings: RandomWalkSettings,
    adapter: ScaleAdapter,
}

impl AlgorithmTemplate for RandomWalk {
    fn name(&self) -> &str {
        "RW"
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
        setup.require_family(self.name(), target, Family::Continuous)?;
        setup.require_scalar(self.name(), target)?;
        if self.settings.log_scale {
            let support = initial_support(setup.graph(), target);
            if !support.is_some_and(|s| s.lower >= 0.) {
                return Err(SpecializeError::ShapeIncompatible {
                    algorithm: self.name().to_string(),
                    node: setup.graph().node(target).name.clone(),
                    reason: "log scale proposals need a non-negative support".to_string(),
                });
            }
        }
        Ok(Box::new(RandomWalkSampler {
            blanket: Blanket::new(setup, ids),
            target,
            settings: self.settings,
            adapter: ScaleAdapter::new(self.settings.scale, 0.44, self.settings.adapt_interval, self.settings.adaptive),
        }))
    }
}

fn reflect(mut x: f64, lower: f64, upper: f64) -> f64 {
    // A proposal can overshoot both bounds when the scale exceeds the width.
    for _ in 0..100 {
        if x < lower {
            x = 2. * lower - x;
        } else if x > upper {
            x = 2. * upper - x;
        } else {
            return x;
        }
    }
    x
}

impl Specialized for RandomWalkSampler {
    fn name(&self) -> &str {
        "RW"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        let graph = self.blanket.graph.clone();
        let range = graph.node(self.target).range();
        self.blanket.save(values);

        let current = values.slice(range.clone())[0];
        let step: f64 = rng.sample::<f64, _>(StandardNormal) * self.adapter.scale();
        let (proposal, log_correction) = if self.settings.log_scale {
            let proposal = current * step.exp();
            (proposal, step)
        } else if self.settings.reflective {
            let dist = graph.node(self.target).distribution().cloned();
            let support = match dist {
                Some(dist) => dist.support(&graph.param_values(values, self.target)),
                None => Default::default(),
            };
            (reflect(current + step, support.lower, support.upper), 0.)
        } else {
            (current + step, 0.)
        };
        values.slice_mut(range)[0] = proposal;

        let accepted = self.blanket.decide(values, rng, log_correction);
        self.adapter.record(accepted);
        Ok(if accepted {
            RunOutcome::Accepted
        } else {
            RunOutcome::Rejected
        })
    }

    fn stats(&self) -> SamplerStats {
        self.adapter.stats()
    }

    fn reset(&mut self) {
        self.adapter.reset();
    }
}

/// Adaptive random walk Metropolis over every element of one or more
/// continuous nodes, with an isotropic normal proposal.
#[derive(Debug, Clone)]
pub struct RandomWalkBlock {
    pub settings: RandomWalkSettings,
}

impl Default for RandomWalkBlock {
    fn default() -> Self {
        RandomWalkBlock {
            settings: RandomWalkSettings {
                scale: 0.1,
                ..Default::default()
            },
        }
    }
}

struct RandomWalkBlockSampler {
    blanket: Blanket,
    adapter: ScaleAdapter,
}

impl AlgorithmTemplate for RandomWalkBlock {
    fn name(&self) -> &str {
        "RW_block"
    }

    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError> {
        let ids = setup.resolve_all(targets)?;
        if ids.is_empty() {
            return Err(SpecializeError::UnresolvedTarget(String::new()));
        }
        for &id in ids.iter() {
            setup.require_family(self.name(), id, Family::Continuous)?;
        }
        Ok(Box::new(RandomWalkBlockSampler {
            blanket: Blanket::new(setup, ids),
            adapter: ScaleAdapter::new(self.settings.scale, 0.234, self.settings.adapt_interval, self.settings.adaptive),
        }))
    }
}

impl Specialized for RandomWalkBlockSampler {
    fn name(&self) -> &str {
        "RW_block"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        self.blanket.save(values);
        let scale = self.adapter.scale();
        for &id in self.blanket.targets.iter() {
            let range = self.blanket.graph.node(id).range();
            for x in values.slice_mut(range).iter_mut() {
                *x += scale * rng.sample::<f64, _>(StandardNormal);
            }
        }
        let accepted = self.blanket.decide(values, rng, 0.);
        self.adapter.record(accepted);
        Ok(if accepted {
            RunOutcome::Accepted
        } else {
            RunOutcome::Rejected
        })
    }

    fn stats(&self) -> SamplerStats {
        self.adapter.stats()
    }

    fn reset(&mut self) {
        self.adapter.reset();
    }
}
