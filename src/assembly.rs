//! Choosing a sampler for every unobserved stochastic node, and turning
//! that choice into a runnable pipeline.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use itertools::Itertools;
use rand::RngCore;
use thiserror::Error;

use crate::{
    distribution::Family,
    graph::{ModelGraph, NodeId, NodeValues},
    samplers::{
        is_binary, Binary, Categorical, Conjugacy, Conjugate, PosteriorPredictive, RandomWalk, RandomWalkBlock,
        RandomWalkDirichlet, RandomWalkSettings, Slice, SliceSettings,
    },
    specialize::{AlgorithmTemplate, RunError, SamplerStats, Setup, SpecializeError, Specialized},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("no sampler applies to node '{0}'")]
    NoApplicableAlgorithm(String),
    #[error("node '{0}' does not exist")]
    UnknownNode(String),
    #[error("invalid sampler order: {0}")]
    InvalidOrder(String),
    #[error(transparent)]
    Specialize(#[from] SpecializeError),
}

/// Chooses a sampler template for a node.
pub trait SamplerMapping: Send + Sync {
    fn select(&self, graph: &ModelGraph, id: NodeId) -> Option<Arc<dyn AlgorithmTemplate>>;
}

/// Picks the first applicable sampler in this order: posterior predictive
/// for nodes without stochastic dependents, then conjugate, binary,
/// categorical, the simplex random walk for Dirichlet nodes, random walk for
/// continuous scalars, block random walk for other continuous vectors and
/// slice for discrete scalars.
#[derive(Debug, Clone, Default)]
pub struct DefaultSamplerMapping {
    pub random_walk: RandomWalkSettings,
    pub block: RandomWalkBlock,
    pub slice: SliceSettings,
}

impl SamplerMapping for DefaultSamplerMapping {
    fn select(&self, graph: &ModelGraph, id: NodeId) -> Option<Arc<dyn AlgorithmTemplate>> {
        let node = graph.node(id);
        if !node.is_stochastic() || node.is_data() {
            return None;
        }
        if graph.stochastic_dependents(id).is_empty() {
            return Some(Arc::new(PosteriorPredictive));
        }
        if Conjugacy::detect(graph, id).is_some() {
            return Some(Arc::new(Conjugate));
        }
        if is_binary(graph, id) {
            return Some(Arc::new(Binary));
        }
        if node.distribution().is_some_and(|d| d.name() == "dcat") && node.shape.len() == 1 {
            return Some(Arc::new(Categorical));
        }
        if node.distribution().is_some_and(|d| d.name() == "ddirch") {
            return Some(Arc::new(RandomWalkDirichlet::new(self.random_walk)));
        }
        match (node.family()?, node.shape.len() == 1) {
            (Family::Continuous, true) => Some(Arc::new(RandomWalk::new(self.random_walk))),
            (Family::Continuous, false) => Some(Arc::new(self.block.clone())),
            (Family::Discrete, true) => Some(Arc::new(Slice::new(self.slice))),
            (Family::Discrete, false) => None,
        }
    }
}

/// One configured sampler: a template and the names of its targets.
#[derive(Clone)]
pub struct SamplerConf {
    pub template: Arc<dyn AlgorithmTemplate>,
    pub targets: Vec<String>,
}

impl Debug for SamplerConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl SamplerConf {
    /// Display name, such as `RW(mu)`.
    pub fn name(&self) -> String {
        format!("{}({})", self.template.name(), self.targets.join(", "))
    }
}

/// An editable list of samplers and monitored nodes for one model.
#[derive(Debug, Clone)]
pub struct McmcConfiguration {
    graph: Arc<ModelGraph>,
    samplers: Vec<SamplerConf>,
    monitors: Vec<String>,
}

impl McmcConfiguration {
    /// Assign a sampler to every non-data stochastic node, in declaration
    /// order. An override for a node wins over the mapping.
    pub fn new(
        graph: Arc<ModelGraph>,
        mapping: &dyn SamplerMapping,
        overrides: &[(&str, Arc<dyn AlgorithmTemplate>)],
    ) -> Result<Self, AssemblyError> {
        let mut by_node = HashMap::new();
        for (name, template) in overrides {
            let id = graph
                .node_id(name)
                .map_err(|_| AssemblyError::UnknownNode(name.to_string()))?;
            by_node.insert(id, template.clone());
        }

        let mut samplers = Vec::new();
        for id in graph.stochastic_nodes() {
            let node = graph.node(id);
            let template = match by_node.get(&id) {
                Some(template) => template.clone(),
                None => mapping
                    .select(&graph, id)
                    .ok_or_else(|| AssemblyError::NoApplicableAlgorithm(node.name.clone()))?,
            };
            samplers.push(SamplerConf {
                template,
                targets: vec![node.name.clone()],
            });
        }

        let monitors = graph
            .names_of(&graph.top_level_nodes())
            .into_iter()
            .map(String::from)
            .collect();
        let config = McmcConfiguration {
            graph,
            samplers,
            monitors,
        };
        log::debug!(
            "assembled samplers [{}]",
            config.sampler_names().join(", ")
        );
        Ok(config)
    }

    /// `new` with `DefaultSamplerMapping` and no overrides.
    pub fn with_defaults(graph: Arc<ModelGraph>) -> Result<Self, AssemblyError> {
        Self::new(graph, &DefaultSamplerMapping::default(), &[])
    }

    pub fn graph(&self) -> &Arc<ModelGraph> {
        &self.graph
    }

    pub fn samplers(&self) -> &[SamplerConf] {
        &self.samplers
    }

    fn check_node(&self, name: &str) -> Result<NodeId, AssemblyError> {
        self.graph
            .node_id(name)
            .map_err(|_| AssemblyError::UnknownNode(name.to_string()))
    }

    /// Append a sampler for `targets`.
    pub fn add_sampler(
        &mut self,
        template: Arc<dyn AlgorithmTemplate>,
        targets: &[&str],
    ) -> Result<(), AssemblyError> {
        for target in targets {
            self.check_node(target)?;
        }
        self.samplers.push(SamplerConf {
            template,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        });
        Ok(())
    }

    /// Remove every sampler that updates `node`. Returns how many were removed.
    pub fn remove_samplers(&mut self, node: &str) -> Result<usize, AssemblyError> {
        self.check_node(node)?;
        let before = self.samplers.len();
        self.samplers.retain(|conf| !conf.targets.iter().any(|t| t == node));
        Ok(before - self.samplers.len())
    }

    /// Put the samplers in the order given by `order`, a permutation of
    /// their current positions.
    pub fn reorder(&mut self, order: &[usize]) -> Result<(), AssemblyError> {
        let n = self.samplers.len();
        if order.len() != n {
            return Err(AssemblyError::InvalidOrder(format!(
                "expected {} positions, got {}",
                n,
                order.len()
            )));
        }
        if let Some(&bad) = order.iter().find(|&&i| i >= n) {
            return Err(AssemblyError::InvalidOrder(format!("position {} out of range", bad)));
        }
        if !order.iter().all_unique() {
            return Err(AssemblyError::InvalidOrder("repeated position".to_string()));
        }
        self.samplers = order.iter().map(|&i| self.samplers[i].clone()).collect();
        Ok(())
    }

    pub fn sampler_names(&self) -> Vec<String> {
        self.samplers.iter().map(SamplerConf::name).collect()
    }

    pub fn monitors(&self) -> &[String] {
        &self.monitors
    }

    pub fn add_monitor(&mut self, name: &str) -> Result<(), AssemblyError> {
        self.check_node(name)?;
        if !self.monitors.iter().any(|m| m == name) {
            self.monitors.push(name.to_string());
        }
        Ok(())
    }

    /// Run the setup stage of every configured sampler.
    pub fn build(&self) -> Result<Pipeline, AssemblyError> {
        let mut setup = Setup::new(self.graph.clone());
        let mut names = Vec::with_capacity(self.samplers.len());
        let mut instances = Vec::with_capacity(self.samplers.len());
        for conf in self.samplers.iter() {
            instances.push(setup.specialize(conf.template.as_ref(), &conf.targets)?);
            names.push(conf.name());
        }
        log::debug!("built pipeline of {} samplers", instances.len());
        Ok(Pipeline {
            graph: self.graph.clone(),
            names,
            instances,
        })
    }
}

/// Specialized sampler instances, run in order once per iteration.
pub struct Pipeline {
    graph: Arc<ModelGraph>,
    names: Vec<String>,
    instances: Vec<Box<dyn Specialized>>,
}

impl Pipeline {
    pub fn graph(&self) -> &Arc<ModelGraph> {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// One iteration: every instance runs once.
    pub fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<(), RunError> {
        for instance in self.instances.iter_mut() {
            let outcome = instance.run(values, rng)?;
            log::trace!("{}: {:?}", instance.name(), outcome);
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<(String, SamplerStats)> {
        self.names
            .iter()
            .cloned()
            .zip(self.instances.iter().map(|i| i.stats()))
            .collect()
    }

    pub fn reset(&mut self) {
        self.instances.iter_mut().for_each(|i| i.reset());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expr::node,
        graph::Relation,
        registry::Registry,
        shape::Shape,
        specialize::LogProbTemplate,
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn model() -> Arc<ModelGraph> {
        let relations = vec![
            Relation::stochastic("p", Shape::scalar(), "dbeta", [("shape1", 1.0.into()), ("shape2", 1.0.into())]),
            Relation::stochastic("y", Shape::scalar(), "dbin", [("prob", node("p")), ("size", 10.0.into())])
                .observed(vec![4.]),
            Relation::stochastic("mu", Shape::scalar(), "dnorm", [("mean", 0.0.into()), ("sd", 1.0.into())]),
            Relation::stochastic("sigma", Shape::scalar(), "dexp", [("rate", 1.0.into())]),
            Relation::stochastic("x", Shape::scalar(), "dnorm", [("mean", node("mu")), ("sd", node("sigma"))])
                .observed(vec![0.3]),
            Relation::stochastic("z", Shape::scalar(), "dbern", [("prob", 0.4.into())]),
            Relation::stochastic("w", Shape::scalar(), "dnorm", [("mean", node("z")), ("sd", 1.0.into())])
                .observed(vec![1.]),
            Relation::stochastic("k", Shape::scalar(), "dpois", [("lambda", 2.0.into())]),
            Relation::stochastic("v", Shape::scalar(), "dpois", [("lambda", node("k") + 1.)]).observed(vec![3.]),
            Relation::stochastic("pi", Shape::vector(2), "ddirch", [("alpha", vec![1., 1.].into())]),
            Relation::stochastic("pred", Shape::scalar(), "dcat", [("prob", node("pi").exp())]),
            Relation::stochastic("c", Shape::scalar(), "dcat", [("prob", vec![1., 1.].into())]),
            Relation::stochastic("u", Shape::scalar(), "dnorm", [("mean", node("c")), ("sd", 1.0.into())])
                .observed(vec![2.]),
        ];
        Arc::new(ModelGraph::build(relations, &Registry::with_builtins()).unwrap())
    }

    #[test]
    fn default_mapping_order() -> Result<()> {
        let config = McmcConfiguration::with_defaults(model())?;
        assert_eq!(
            config.sampler_names(),
            vec![
                "conjugate(p)",
                "conjugate(mu)",
                "RW(sigma)",
                "binary(z)",
                "slice(k)",
                "RW_dirichlet(pi)",
                "posterior_predictive(pred)",
                "categorical(c)",
            ]
        );
        assert_eq!(config.monitors(), ["p", "mu", "sigma", "z", "k", "pi", "c"]);
        let pipeline = config.build()?;
        assert_eq!(pipeline.len(), 8);
        Ok(())
    }

    #[test]
    fn overrides_and_edits() -> Result<()> {
        let graph = model();
        let rw: Arc<dyn AlgorithmTemplate> = Arc::new(RandomWalk::default());
        let mut config = McmcConfiguration::new(graph.clone(), &DefaultSamplerMapping::default(), &[("mu", rw.clone())])?;
        assert_eq!(config.sampler_names()[1], "RW(mu)");

        assert_eq!(
            McmcConfiguration::new(graph.clone(), &DefaultSamplerMapping::default(), &[("nope", rw.clone())]).err(),
            Some(AssemblyError::UnknownNode("nope".to_string()))
        );

        assert_eq!(config.remove_samplers("mu")?, 1);
        config.add_sampler(rw.clone(), &["mu", "sigma"])?;
        assert_eq!(config.sampler_names().last().map(String::as_str), Some("RW(mu, sigma)"));
        assert!(config.add_sampler(rw, &["missing"]).is_err());

        let n = config.samplers().len();
        let mut order: Vec<usize> = (0..n).rev().collect();
        config.reorder(&order)?;
        assert_eq!(config.sampler_names()[0], "RW(mu, sigma)");
        order[0] = order[1];
        assert!(matches!(config.reorder(&order), Err(AssemblyError::InvalidOrder(_))));
        assert!(matches!(config.reorder(&[0]), Err(AssemblyError::InvalidOrder(_))));

        config.add_monitor("x")?;
        config.add_monitor("x")?;
        assert_eq!(config.monitors().iter().filter(|m| *m == "x").count(), 1);
        assert!(config.add_monitor("nope").is_err());

        // multi-target RW fails at build time
        assert!(matches!(config.build(), Err(AssemblyError::Specialize(_))));
        Ok(())
    }

    #[test]
    fn default_samplers_move_their_nodes() -> Result<()> {
        let graph = model();
        let config = McmcConfiguration::with_defaults(graph.clone())?;
        let mut pipeline = config.build()?;
        let mut values = graph.new_values();
        let mut rng = StdRng::seed_from_u64(9);
        let all = graph.stochastic_nodes();
        graph.simulate(&mut values, &all, &mut rng);
        let set = graph.get_dependencies(&all, &Default::default());
        graph.calculate(&mut values, &set);

        let mut seen: HashMap<NodeId, Vec<Vec<f64>>> = HashMap::new();
        for _ in 0..500 {
            pipeline.run(&mut values, &mut rng)?;
            for &id in all.iter() {
                let draws = seen.entry(id).or_default();
                let value = values.get(graph.node(id)).to_vec();
                if !draws.contains(&value) {
                    draws.push(value);
                }
            }
        }
        for &id in all.iter() {
            assert!(seen[&id].len() > 1, "{} never moved", graph.node(id).name);
        }
        for (name, stats) in pipeline.stats() {
            assert!(stats.accepted > 0, "{} accepted nothing", name);
        }
        Ok(())
    }

    #[test]
    fn run_stage_reuses_precomputed_sets() -> Result<()> {
        let graph = model();
        let mut pipeline = McmcConfiguration::with_defaults(graph.clone())?.build()?;
        let mut values = graph.new_values();
        let mut rng = StdRng::seed_from_u64(13);
        let all = graph.stochastic_nodes();
        graph.simulate(&mut values, &all, &mut rng);
        let set = graph.get_dependencies(&all, &Default::default());
        graph.calculate(&mut values, &set);

        let before = crate::deps::resolve_calls();
        for _ in 0..50 {
            pipeline.run(&mut values, &mut rng)?;
        }
        assert_eq!(crate::deps::resolve_calls(), before);
        Ok(())
    }

    struct Nothing;

    impl SamplerMapping for Nothing {
        fn select(&self, _graph: &ModelGraph, _id: NodeId) -> Option<Arc<dyn AlgorithmTemplate>> {
            None
        }
    }

    #[test]
    fn no_applicable_algorithm() {
        let graph = model();
        let err = McmcConfiguration::new(graph.clone(), &Nothing, &[]).err();
        assert_eq!(err, Some(AssemblyError::NoApplicableAlgorithm("p".to_string())));

        let log_prob: Arc<dyn AlgorithmTemplate> = Arc::new(LogProbTemplate::default());
        let overrides: Vec<(&str, Arc<dyn AlgorithmTemplate>)> = graph
            .names_of(&graph.stochastic_nodes())
            .into_iter()
            .map(|name| (name, log_prob.clone()))
            .collect();
        assert!(McmcConfiguration::new(graph.clone(), &Nothing, &overrides).is_ok());
    }

    #[test]
    fn pipeline_runs_every_sampler() -> Result<()> {
        let graph = model();
        let mut pipeline = McmcConfiguration::with_defaults(graph.clone())?.build()?;
        let mut values = graph.new_values();
        let mut rng = StdRng::seed_from_u64(5);
        let all = graph.stochastic_nodes();
        graph.simulate(&mut values, &all, &mut rng);
        let set = graph.get_dependencies(&all, &Default::default());
        graph.calculate(&mut values, &set);
        for _ in 0..200 {
            pipeline.run(&mut values, &mut rng)?;
        }
        let stats = pipeline.stats();
        assert_eq!(stats.len(), pipeline.len());
        // component-wise samplers count one proposal per element
        assert!(stats.iter().all(|(_, s)| s.proposed >= 200));
        assert!(graph.get_log_prob(&values, &set).is_finite());
        pipeline.reset();
        assert_eq!(pipeline.stats()[0].1.proposed, 0);
        Ok(())
    }
}
