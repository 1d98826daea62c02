//! Two-stage evaluation of algorithm templates.
//!
//! An `AlgorithmTemplate` is written once against the abstract model API.
//! Its setup stage runs against a concrete graph and a set of target names,
//! resolves names to ids, precomputes dependency sets and allocates scratch
//! storage. The result is a `Specialized` instance whose run stage only
//! touches what setup prepared and the live value buffer.

use std::{fmt::Debug, ops::Range, sync::Arc};

use rand::RngCore;
use thiserror::Error;

use crate::{
    deps::{DependencyOptions, DependencySet, Direction},
    distribution::Family,
    graph::{GraphError, ModelGraph, NodeId, NodeKind, NodeValues},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecializeError {
    #[error("target '{0}' does not name a node of the model")]
    UnresolvedTarget(String),
    #[error("{algorithm} cannot be applied to node '{node}': {reason}")]
    ShapeIncompatible {
        algorithm: String,
        node: String,
        reason: String,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors a specialized instance chooses to propagate from its run stage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("{algorithm} expected {expected} input values, got {actual}")]
    InputLength {
        algorithm: String,
        expected: usize,
        actual: usize,
    },
    #[error("{algorithm} produced a non-finite log-probability at node '{node}'")]
    NonFinite { algorithm: String, node: String },
}

/// What one execution of a run stage did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Accepted,
    Rejected,
    /// A numeric result, such as a log-probability.
    Value(f64),
    /// Targets were overwritten without an accept/reject decision.
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[non_exhaustive]
pub struct SamplerStats {
    pub proposed: u64,
    pub accepted: u64,
    /// Current proposal scale of adaptive samplers.
    pub scale: Option<f64>,
}

impl SamplerStats {
    pub fn new(proposed: u64, accepted: u64, scale: Option<f64>) -> Self {
        SamplerStats {
            proposed,
            accepted,
            scale,
        }
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            return 0.;
        }
        self.accepted as f64 / self.proposed as f64
    }
}

/// A generic algorithm, before it is bound to a model.
pub trait AlgorithmTemplate: Send + Sync {
    fn name(&self) -> &str;

    /// The setup stage. Must fail instead of deferring checks to `run`.
    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError>;
}

impl Debug for dyn AlgorithmTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AlgorithmTemplate<{}>", self.name())
    }
}

/// A template bound to a model: fixed targets, dependency sets and scratch
/// storage, plus its own mutable state.
pub trait Specialized: Send {
    fn name(&self) -> &str;

    fn targets(&self) -> &[NodeId];

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError>;

    fn stats(&self) -> SamplerStats {
        SamplerStats::default()
    }

    /// Clear adaptation and acceptance counters.
    fn reset(&mut self) {}
}

/// Saved copy of the values and cached log-probabilities of a node set.
///
/// Samplers save before proposing and restore on rejection, which puts
/// targets, deterministic dependents and caches back exactly.
#[derive(Debug, Clone)]
pub struct Scratch {
    ranges: Vec<Range<usize>>,
    stochastic: Vec<NodeId>,
    values: Vec<f64>,
    logprob: Vec<f64>,
}

impl Scratch {
    pub fn save(&mut self, values: &NodeValues) {
        let mut pos = 0;
        for range in self.ranges.iter() {
            let len = range.len();
            self.values[pos..pos + len].copy_from_slice(values.slice(range.clone()));
            pos += len;
        }
        for (cached, &id) in self.logprob.iter_mut().zip(self.stochastic.iter()) {
            *cached = values.cached_logprob(id);
        }
    }

    pub fn restore(&self, values: &mut NodeValues) {
        let mut pos = 0;
        for range in self.ranges.iter() {
            let len = range.len();
            values
                .slice_mut(range.clone())
                .copy_from_slice(&self.values[pos..pos + len]);
            pos += len;
        }
        for (&cached, &id) in self.logprob.iter().zip(self.stochastic.iter()) {
            values.set_cached_logprob(id, cached);
        }
    }

    /// Number of saved value elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The setup-stage context: a graph plus name resolution and the checks
/// templates use to reject unsuitable targets.
pub struct Setup {
    graph: Arc<ModelGraph>,
    specialized: usize,
}

impl Setup {
    pub fn new(graph: Arc<ModelGraph>) -> Self {
        Setup {
            graph,
            specialized: 0,
        }
    }

    pub fn graph(&self) -> &Arc<ModelGraph> {
        &self.graph
    }

    /// Number of instances produced through `specialize` so far.
    pub fn num_specialized(&self) -> usize {
        self.specialized
    }

    /// Run the setup stage of `template` for `targets`.
    pub fn specialize(
        &mut self,
        template: &dyn AlgorithmTemplate,
        targets: &[String],
    ) -> Result<Box<dyn Specialized>, SpecializeError> {
        let instance = template.setup(self, targets)?;
        self.specialized += 1;
        log::debug!(
            "specialized {} for targets {:?}",
            template.name(),
            targets
        );
        Ok(instance)
    }

    pub fn resolve(&self, name: &str) -> Result<NodeId, SpecializeError> {
        self.graph
            .node_id(name)
            .map_err(|_| SpecializeError::UnresolvedTarget(name.to_string()))
    }

    pub fn resolve_all(&self, names: &[String]) -> Result<Vec<NodeId>, SpecializeError> {
        names.iter().map(|name| self.resolve(name)).collect()
    }

    pub fn dependencies(&self, ids: &[NodeId], options: &DependencyOptions) -> DependencySet {
        self.graph.get_dependencies(ids, options)
    }

    /// The targets, their deterministic dependents and first stochastic
    /// dependents.
    pub fn calc_nodes(&self, ids: &[NodeId]) -> DependencySet {
        self.dependencies(ids, &DependencyOptions::markov_blanket())
    }

    /// The deterministic ancestors of `ids`, and `ids` themselves.
    pub fn ancestors_to_recompute(&self, ids: &[NodeId]) -> DependencySet {
        let options = DependencyOptions {
            direction: Direction::Upstream,
            include_stochastic: false,
            include_data: false,
            ..Default::default()
        };
        let graph = &self.graph;
        self.dependencies(ids, &options)
            .filter(|id| graph.node(id).kind() != NodeKind::Constant)
    }

    fn incompatible(&self, algorithm: &str, id: NodeId, reason: impl ToString) -> SpecializeError {
        SpecializeError::ShapeIncompatible {
            algorithm: algorithm.to_string(),
            node: self.graph.node(id).name.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn require_scalar(&self, algorithm: &str, id: NodeId) -> Result<(), SpecializeError> {
        let shape = &self.graph.node(id).shape;
        if shape.len() != 1 {
            return Err(self.incompatible(algorithm, id, format!("needs a scalar node, got shape {}", shape)));
        }
        Ok(())
    }

    pub fn require_vector(&self, algorithm: &str, id: NodeId) -> Result<(), SpecializeError> {
        let shape = &self.graph.node(id).shape;
        if !shape.is_vector() {
            return Err(self.incompatible(algorithm, id, format!("needs a vector node, got shape {}", shape)));
        }
        Ok(())
    }

    /// The node must be a non-data stochastic node of the given family.
    pub fn require_family(&self, algorithm: &str, id: NodeId, family: Family) -> Result<(), SpecializeError> {
        self.require_sampleable(algorithm, id)?;
        match self.graph.node(id).family() {
            Some(f) if f == family => Ok(()),
            other => Err(self.incompatible(
                algorithm,
                id,
                format!("needs a {:?} distribution, got {:?}", family, other),
            )),
        }
    }

    pub fn require_sampleable(&self, algorithm: &str, id: NodeId) -> Result<(), SpecializeError> {
        let node = self.graph.node(id);
        if !node.is_stochastic() {
            return Err(self.incompatible(algorithm, id, "not a stochastic node"));
        }
        if node.is_data() {
            return Err(self.incompatible(algorithm, id, "node is data"));
        }
        Ok(())
    }

    /// Scratch storage for the value-carrying nodes of `set`, sized from
    /// their shapes.
    pub fn scratch(&self, set: &DependencySet) -> Scratch {
        let mut ranges = Vec::new();
        let mut stochastic = Vec::new();
        for id in set.iter() {
            let node = self.graph.node(id);
            match node.kind() {
                NodeKind::Constant => continue,
                NodeKind::Stochastic => stochastic.push(id),
                NodeKind::Deterministic => {}
            }
            ranges.push(node.range());
        }
        let len = ranges.iter().map(|r| r.len()).sum();
        Scratch {
            ranges,
            values: vec![0.; len],
            logprob: vec![0.; stochastic.len()],
            stochastic,
        }
    }
}

/// Evaluates the log-probability of its targets.
#[derive(Debug, Clone, Default)]
pub struct LogProbTemplate {
    /// Fail instead of returning `-inf`.
    pub strict: bool,
}

/// A `LogProbTemplate` bound to a model.
pub struct LogProb {
    graph: Arc<ModelGraph>,
    targets: Vec<NodeId>,
    set: DependencySet,
    strict: bool,
}

impl LogProbTemplate {
    pub fn specialize(&self, setup: &mut Setup, targets: &[String]) -> Result<LogProb, SpecializeError> {
        let ids = setup.resolve_all(targets)?;
        let set = setup.ancestors_to_recompute(&ids);
        Ok(LogProb {
            graph: setup.graph().clone(),
            targets: ids,
            set,
            strict: self.strict,
        })
    }
}

impl AlgorithmTemplate for LogProbTemplate {
    fn name(&self) -> &str {
        "log_prob"
    }

    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError> {
        Ok(Box::new(self.specialize(setup, targets)?))
    }
}

impl LogProb {
    /// Recompute deterministic ancestors and sum the targets' log densities.
    pub fn evaluate(&self, values: &mut NodeValues) -> Result<f64, RunError> {
        let logp = self.graph.calculate(values, &self.set);
        if self.strict && !logp.is_finite() {
            let node = self
                .targets
                .iter()
                .find(|&&id| !values.cached_logprob(id).is_finite())
                .map(|&id| self.graph.node(id).name.clone())
                .unwrap_or_default();
            return Err(RunError::NonFinite {
                algorithm: "log_prob".to_string(),
                node,
            });
        }
        Ok(logp)
    }

    pub fn dependencies(&self) -> &DependencySet {
        &self.set
    }
}

impl Specialized for LogProb {
    fn name(&self) -> &str {
        "log_prob"
    }

    fn targets(&self) -> &[NodeId] {
        &self.targets
    }

    fn run(&mut self, values: &mut NodeValues, _rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        self.evaluate(values).map(RunOutcome::Value)
    }
}

/// An objective over a flat parameter vector, for an external optimiser.
#[derive(Debug, Clone, Default)]
pub struct ObjectiveTemplate;

pub struct Objective {
    graph: Arc<ModelGraph>,
    targets: Vec<NodeId>,
    ranges: Vec<Range<usize>>,
    set: DependencySet,
    dim: usize,
}

impl ObjectiveTemplate {
    pub fn specialize(&self, setup: &mut Setup, targets: &[String]) -> Result<Objective, SpecializeError> {
        let ids = setup.resolve_all(targets)?;
        for &id in ids.iter() {
            setup.require_sampleable("objective", id)?;
        }
        let graph = setup.graph().clone();
        let ranges: Vec<_> = ids.iter().map(|&id| graph.node(id).range()).collect();
        let dim = ranges.iter().map(|r| r.len()).sum();
        Ok(Objective {
            set: setup.calc_nodes(&ids),
            graph,
            targets: ids,
            ranges,
            dim,
        })
    }
}

impl AlgorithmTemplate for ObjectiveTemplate {
    fn name(&self) -> &str {
        "objective"
    }

    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError> {
        Ok(Box::new(self.specialize(setup, targets)?))
    }
}

impl Objective {
    /// Total number of target elements.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Write `x` into the targets, recalculate and return the
    /// log-probability of the targets and their dependents.
    pub fn evaluate(&self, values: &mut NodeValues, x: &[f64]) -> Result<f64, RunError> {
        if x.len() != self.dim {
            return Err(RunError::InputLength {
                algorithm: "objective".to_string(),
                expected: self.dim,
                actual: x.len(),
            });
        }
        let mut pos = 0;
        for range in self.ranges.iter() {
            let len = range.len();
            values
                .slice_mut(range.clone())
                .copy_from_slice(&x[pos..pos + len]);
            pos += len;
        }
        Ok(self.graph.calculate(values, &self.set))
    }

    /// Current target values as a flat vector.
    pub fn current(&self, values: &NodeValues) -> Vec<f64> {
        self.ranges
            .iter()
            .flat_map(|range| values.slice(range.clone()).iter().copied())
            .collect()
    }
}

impl Specialized for Objective {
    fn name(&self) -> &str {
        "objective"
    }

    fn targets(&self) -> &[NodeId] {
        &self.targets
    }

    fn run(&mut self, values: &mut NodeValues, _rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        Ok(RunOutcome::Value(self.graph.calculate(values, &self.set)))
    }
}
