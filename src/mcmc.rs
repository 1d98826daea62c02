//! Running configured samplers over one or more chains.

use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
    assembly::{McmcConfiguration, Pipeline},
    graph::{ModelGraph, NodeId, NodeValues},
    specialize::SamplerStats,
};

/// Settings for an MCMC run.
#[derive(Debug, Clone, Copy)]
pub struct McmcSettings {
    /// Number of iterations recorded after burn-in, before thinning.
    pub num_iter: u64,
    /// Number of initial iterations that are discarded. Samplers keep
    /// adapting after burn-in.
    pub num_burnin: u64,
    /// Keep every `thin`-th iteration.
    pub thin: u64,
    pub num_chains: usize,
    pub seed: u64,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            num_iter: 1000,
            num_burnin: 500,
            thin: 1,
            num_chains: 4,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub chain: u64,
    pub iteration: u64,
    pub burnin: bool,
}

const MAX_INIT_TRIES: usize = 100;

/// One chain: its own values, sampler pipeline and random stream.
pub struct Chain {
    id: u64,
    graph: Arc<ModelGraph>,
    values: NodeValues,
    pipeline: Pipeline,
    rng: ChaCha8Rng,
    iteration: u64,
    num_burnin: u64,
}

impl Chain {
    pub fn new(config: &McmcConfiguration, settings: &McmcSettings, chain: u64) -> Result<Self> {
        let pipeline = config.build().context("Could not build the sampler pipeline")?;
        let graph = config.graph().clone();
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        rng.set_stream(chain);
        Ok(Chain {
            id: chain,
            values: graph.new_values(),
            graph,
            pipeline,
            rng,
            iteration: 0,
            num_burnin: settings.num_burnin,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn values(&self) -> &NodeValues {
        &self.values
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Set the given initial values and simulate every other unobserved
    /// stochastic node from its prior until the model has a finite
    /// log-probability.
    pub fn init(&mut self, inits: &[(&str, &[f64])]) -> Result<()> {
        let graph = self.graph.clone();
        let mut given = Vec::with_capacity(inits.len());
        for &(name, value) in inits {
            let id = graph
                .node_id(name)
                .context("Unknown node in initial values")?;
            let node = graph.node(id);
            if value.len() != node.shape.len() {
                bail!(
                    "Initial value for '{}' has {} elements, expected {}",
                    name,
                    value.len(),
                    node.shape.len()
                );
            }
            self.values.get_mut(node).copy_from_slice(value);
            given.push(id);
        }
        let missing: Vec<NodeId> = graph
            .stochastic_nodes()
            .into_iter()
            .filter(|id| !given.contains(id))
            .collect();
        let all: Vec<NodeId> = (0..graph.len()).map(NodeId).collect();
        let everything = graph.get_dependencies(&all, &Default::default());

        graph.calculate(&mut self.values, &everything);
        for attempt in 0..MAX_INIT_TRIES {
            graph.simulate(&mut self.values, &missing, &mut self.rng);
            let logp = graph.calculate(&mut self.values, &everything);
            if logp.is_finite() {
                log::debug!(
                    "chain {} initialized after {} attempts, logp {:.3}",
                    self.id,
                    attempt + 1,
                    logp
                );
                return Ok(());
            }
        }
        bail!(
            "All {} initialization attempts of chain {} gave a non-finite log-probability",
            MAX_INIT_TRIES,
            self.id
        )
    }

    /// Run every sampler once.
    pub fn step(&mut self) -> Result<Progress> {
        self.pipeline
            .run(&mut self.values, &mut self.rng)
            .with_context(|| format!("Sampler failed in iteration {}", self.iteration))?;
        let progress = Progress {
            chain: self.id,
            iteration: self.iteration,
            burnin: self.iteration < self.num_burnin,
        };
        self.iteration += 1;
        Ok(progress)
    }

    /// Current value of a node.
    pub fn value(&self, name: &str) -> Result<Vec<f64>> {
        let id = self.graph.node_id(name)?;
        Ok(self.values.get(self.graph.node(id)).to_vec())
    }
}

/// Draws and sampler statistics of one chain.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain: u64,
    pub monitors: Vec<String>,
    /// Recorded values per monitored node, one entry per kept iteration.
    pub draws: HashMap<String, Vec<Vec<f64>>>,
    pub stats: Vec<(String, SamplerStats)>,
}

impl ChainOutput {
    pub fn draws(&self, name: &str) -> Option<&[Vec<f64>]> {
        self.draws.get(name).map(|d| d.as_slice())
    }

    /// Element-wise mean of the draws of a monitored node.
    pub fn mean(&self, name: &str) -> Option<Vec<f64>> {
        let draws = self.draws.get(name)?;
        let first = draws.first()?;
        let mut sum = vec![0.; first.len()];
        for draw in draws.iter() {
            sum.iter_mut().zip(draw).for_each(|(s, x)| *s += x);
        }
        Some(sum.into_iter().map(|s| s / draws.len() as f64).collect())
    }

    pub fn num_draws(&self) -> usize {
        self.draws.values().next().map_or(0, |d| d.len())
    }
}

/// Output of all chains, in chain order.
#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: Vec<ChainOutput>,
}

impl Trace {
    /// Element-wise mean over the draws of every chain.
    pub fn mean(&self, name: &str) -> Option<Vec<f64>> {
        let means = self
            .chains
            .iter()
            .map(|c| Some((c.mean(name)?, c.draws.get(name)?.len())))
            .collect::<Option<Vec<_>>>()?;
        let total: usize = means.iter().map(|(_, n)| n).sum();
        let dim = means.first()?.0.len();
        let mut out = vec![0.; dim];
        for (mean, n) in means.iter() {
            out.iter_mut()
                .zip(mean)
                .for_each(|(o, m)| *o += m * *n as f64 / total as f64);
        }
        Some(out)
    }
}

/// Initialize and run one chain, recording the configured monitors.
pub fn run_chain(
    config: &McmcConfiguration,
    settings: &McmcSettings,
    chain: u64,
    inits: &[(&str, &[f64])],
) -> Result<ChainOutput> {
    let mut sampler = Chain::new(config, settings, chain)?;
    sampler
        .init(inits)
        .context("Failed to find an initial point")?;

    let graph = config.graph().clone();
    let monitors = config.monitors().to_vec();
    let ids = monitors
        .iter()
        .map(|name| graph.node_id(name))
        .collect::<Result<Vec<_>, _>>()?;
    let thin = settings.thin.max(1);
    let mut draws: Vec<Vec<Vec<f64>>> = vec![Vec::with_capacity((settings.num_iter / thin) as usize); ids.len()];

    for _ in 0..settings.num_burnin + settings.num_iter {
        let progress = sampler.step()?;
        if progress.burnin || (progress.iteration - settings.num_burnin + 1) % thin != 0 {
            continue;
        }
        for (out, &id) in draws.iter_mut().zip(ids.iter()) {
            out.push(sampler.values().get(graph.node(id)).to_vec());
        }
    }

    Ok(ChainOutput {
        chain,
        draws: monitors.iter().cloned().zip(draws).collect(),
        monitors,
        stats: sampler.pipeline().stats(),
    })
}

/// Run `settings.num_chains` chains in parallel. Results do not depend on
/// scheduling: chain `i` always uses random stream `i` of `settings.seed`.
pub fn run_chains(
    config: &McmcConfiguration,
    settings: &McmcSettings,
    inits: &[(&str, &[f64])],
) -> Result<Trace> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(settings.num_chains.max(1))
        .build()
        .context("Could not start thread pool")?;
    let chains = pool.install(|| {
        (0..settings.num_chains as u64)
            .into_par_iter()
            .map(|chain| {
                run_chain(config, settings, chain, inits).with_context(|| format!("Chain {} failed", chain))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    Ok(Trace { chains })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{expr::node, graph::Relation, registry::Registry, shape::Shape};
    use pretty_assertions::assert_eq;

    fn config() -> McmcConfiguration {
        let relations = vec![
            Relation::stochastic("mu", Shape::scalar(), "dnorm", [("mean", 0.0.into()), ("sd", 5.0.into())]),
            Relation::stochastic("sigma", Shape::scalar(), "dunif", [("min", 0.0.into()), ("max", 10.0.into())]),
            Relation::stochastic("y", Shape::scalar(), "dnorm", [("mean", node("mu")), ("sd", node("sigma"))])
                .observed(vec![1.]),
        ];
        let graph = ModelGraph::build(relations, &Registry::with_builtins()).unwrap();
        McmcConfiguration::with_defaults(Arc::new(graph)).unwrap()
    }

    #[test]
    fn thinning_and_burnin() -> Result<()> {
        let settings = McmcSettings {
            num_iter: 100,
            num_burnin: 20,
            thin: 3,
            num_chains: 1,
            seed: 1,
        };
        let output = run_chain(&config(), &settings, 0, &[])?;
        assert_eq!(output.num_draws(), 33);
        assert_eq!(output.monitors, vec!["mu", "sigma"]);
        assert!(output.draws("sigma").unwrap().iter().all(|s| s[0] > 0. && s[0] < 10.));
        assert_eq!(output.stats.len(), 2);
        assert_eq!(output.stats[0].1.proposed, 120);
        Ok(())
    }

    #[test]
    fn init_respects_given_values() -> Result<()> {
        let config = config();
        let settings = McmcSettings::default();
        let mut chain = Chain::new(&config, &settings, 0)?;
        chain.init(&[("mu", &[0.25])])?;
        assert_eq!(chain.value("mu")?, vec![0.25]);
        assert!(chain.value("sigma")?[0] > 0.);

        assert!(chain.init(&[("mu", &[1., 2.])]).is_err());
        assert!(chain.init(&[("nope", &[1.])]).is_err());
        // sigma = 20 is outside dunif(0, 10) and never simulated
        assert!(chain.init(&[("sigma", &[20.])]).is_err());
        Ok(())
    }

    #[test]
    fn chains_use_separate_streams() -> Result<()> {
        let settings = McmcSettings {
            num_iter: 50,
            num_burnin: 0,
            num_chains: 2,
            ..Default::default()
        };
        let trace = run_chains(&config(), &settings, &[])?;
        assert_eq!(trace.chains.len(), 2);
        assert_eq!(trace.chains[1].chain, 1);
        assert!(trace.chains[0].draws("mu") != trace.chains[1].draws("mu"));
        assert!(trace.mean("mu").is_some());
        assert!(trace.mean("nope").is_none());
        Ok(())
    }
}
