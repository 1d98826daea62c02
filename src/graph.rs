//! The model graph: node declarations, their resolved definitions and the
//! flat value storage they operate on.
//!
//! A `ModelGraph` is immutable once built and is shared between chains. All
//! mutable state lives in `NodeValues`, so that independent copies of a model
//! can be advanced on separate threads.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::Arc,
};

use rand::RngCore;
use thiserror::Error;

use crate::{
    deps::{self, DependencyOptions, DependencySet, Direction},
    distribution::{Distribution, Family},
    expr::{Env, Expr},
    registry::{Registry, RegistryError},
    shape::Shape,
};

/// Index of a node in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("node '{node}' references '{reference}' before it is declared")]
    CyclicDependency { node: String, reference: String },
    #[error("shape mismatch at node '{node}': {reason}")]
    ShapeMismatch { node: String, reason: String },
    #[error("node '{0}' is declared more than once")]
    DuplicateNode(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("node '{node}' has no parameter '{param}'")]
    UnknownParameter { node: String, param: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How a node is defined in a relation list.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationKind {
    Constant(Vec<f64>),
    Deterministic(Expr<String>),
    Stochastic {
        distribution: String,
        params: Vec<(String, Expr<String>)>,
        observed: Option<Vec<f64>>,
    },
}

/// A single node declaration, as produced by a model front-end.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub name: String,
    pub shape: Shape,
    pub kind: RelationKind,
}

impl Relation {
    pub fn constant(name: &str, shape: Shape, value: impl Into<Vec<f64>>) -> Self {
        Relation {
            name: name.to_string(),
            shape,
            kind: RelationKind::Constant(value.into()),
        }
    }

    pub fn deterministic(name: &str, shape: Shape, expr: Expr<String>) -> Self {
        Relation {
            name: name.to_string(),
            shape,
            kind: RelationKind::Deterministic(expr),
        }
    }

    /// A stochastic node. Parameter names may be the canonical names of the
    /// distribution or any of its alternate parameterizations.
    pub fn stochastic<'a>(
        name: &str,
        shape: Shape,
        distribution: &str,
        params: impl IntoIterator<Item = (&'a str, Expr<String>)>,
    ) -> Self {
        Relation {
            name: name.to_string(),
            shape,
            kind: RelationKind::Stochastic {
                distribution: distribution.to_string(),
                params: params
                    .into_iter()
                    .map(|(n, e)| (n.to_string(), e))
                    .collect(),
                observed: None,
            },
        }
    }

    /// Mark a stochastic node as data with a fixed value. Has no effect on
    /// other kinds.
    pub fn observed(mut self, value: impl Into<Vec<f64>>) -> Self {
        if let RelationKind::Stochastic { observed, .. } = &mut self.kind {
            *observed = Some(value.into());
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Constant,
    Deterministic,
    Stochastic,
}

/// A stochastic node's resolved distribution and canonical parameters.
#[derive(Debug, Clone)]
pub struct StochasticDef {
    pub distribution: Arc<dyn Distribution>,
    /// One expression per canonical parameter, in canonical order.
    pub params: Vec<Expr<NodeId>>,
    pub param_shapes: Vec<Shape>,
    /// Index of the alternate parameterization the node was declared with.
    pub alternate: Option<usize>,
    pub data: Option<Vec<f64>>,
    param_ranges: Vec<Range<usize>>,
}

#[derive(Debug, Clone)]
enum Definition {
    Constant(Vec<f64>),
    Deterministic(Expr<NodeId>),
    Stochastic(StochasticDef),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub shape: Shape,
    offset: usize,
    definition: Definition,
    parents: Vec<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self.definition {
            Definition::Constant(_) => NodeKind::Constant,
            Definition::Deterministic(_) => NodeKind::Deterministic,
            Definition::Stochastic(_) => NodeKind::Stochastic,
        }
    }

    pub fn is_stochastic(&self) -> bool {
        self.kind() == NodeKind::Stochastic
    }

    pub fn is_deterministic(&self) -> bool {
        self.kind() == NodeKind::Deterministic
    }

    pub fn is_data(&self) -> bool {
        matches!(&self.definition, Definition::Stochastic(def) if def.data.is_some())
    }

    /// Location of this node's value in a `NodeValues` buffer.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.shape.len()
    }

    pub fn stochastic(&self) -> Option<&StochasticDef> {
        match &self.definition {
            Definition::Stochastic(def) => Some(def),
            _ => None,
        }
    }

    pub fn distribution(&self) -> Option<&Arc<dyn Distribution>> {
        self.stochastic().map(|def| &def.distribution)
    }

    pub fn family(&self) -> Option<Family> {
        self.distribution().map(|d| d.family())
    }

    pub fn expr(&self) -> Option<&Expr<NodeId>> {
        match &self.definition {
            Definition::Deterministic(expr) => Some(expr),
            _ => None,
        }
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Mutable state of one model instance: node values, canonical parameter
/// values and the cached log-probability of every stochastic node.
#[derive(Debug, Clone)]
pub struct NodeValues {
    values: Vec<f64>,
    params: Vec<f64>,
    logprob: Vec<f64>,
    scratch: Vec<f64>,
}

impl NodeValues {
    pub fn get(&self, node: &Node) -> &[f64] {
        &self.values[node.range()]
    }

    pub fn get_mut(&mut self, node: &Node) -> &mut [f64] {
        &mut self.values[node.range()]
    }

    pub fn slice(&self, range: Range<usize>) -> &[f64] {
        &self.values[range]
    }

    pub fn slice_mut(&mut self, range: Range<usize>) -> &mut [f64] {
        &mut self.values[range]
    }

    /// Cached log-probability of a node. Zero for non-stochastic nodes.
    pub fn cached_logprob(&self, id: NodeId) -> f64 {
        self.logprob[id.0]
    }

    pub(crate) fn set_cached_logprob(&mut self, id: NodeId, logp: f64) {
        self.logprob[id.0] = logp;
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// Equal when node values and cached log-probabilities agree. Parameter
/// and scratch buffers are working storage and not compared.
impl PartialEq for NodeValues {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.logprob == other.logprob
    }
}

/// Expression environment over a value buffer.
pub struct GraphEnv<'a> {
    graph: &'a ModelGraph,
    values: &'a [f64],
}

impl Env<NodeId> for GraphEnv<'_> {
    fn value(&self, r: &NodeId) -> &[f64] {
        &self.values[self.graph.nodes[r.0].range()]
    }

    fn shape(&self, r: &NodeId) -> &Shape {
        &self.graph.nodes[r.0].shape
    }
}

/// A built model: nodes in declaration order, which is a topological order.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    nodes: Vec<Node>,
    names: HashMap<String, NodeId>,
    value_len: usize,
    param_len: usize,
    scratch_len: usize,
}

fn shape_error(node: &str, reason: impl ToString) -> GraphError {
    GraphError::ShapeMismatch {
        node: node.to_string(),
        reason: reason.to_string(),
    }
}

impl ModelGraph {
    /// Build a graph from an ordered relation list.
    ///
    /// Every reference must name a node declared earlier in the list. The
    /// distribution of each stochastic node is resolved once, here.
    pub fn build(
        relations: impl IntoIterator<Item = Relation>,
        registry: &Registry,
    ) -> Result<Self, GraphError> {
        let relations: Vec<Relation> = relations.into_iter().collect();
        let declared: HashSet<&str> = relations.iter().map(|r| r.name.as_str()).collect();

        let mut graph = ModelGraph {
            nodes: Vec::with_capacity(relations.len()),
            names: HashMap::with_capacity(relations.len()),
            value_len: 0,
            param_len: 0,
            scratch_len: 0,
        };

        for relation in relations.iter() {
            if graph.names.contains_key(&relation.name) {
                return Err(GraphError::DuplicateNode(relation.name.clone()));
            }
            let id = NodeId(graph.nodes.len());
            let definition = graph.resolve_definition(relation, &declared, registry)?;

            let mut parents: Vec<NodeId> = match &definition {
                Definition::Constant(_) => Vec::new(),
                Definition::Deterministic(expr) => expr.refs().into_iter().copied().collect(),
                Definition::Stochastic(def) => def
                    .params
                    .iter()
                    .flat_map(|p| p.refs().into_iter().copied())
                    .collect(),
            };
            parents.sort();
            parents.dedup();
            for parent in parents.iter() {
                graph.nodes[parent.0].children.push(id);
            }

            let len = relation.shape.len();
            graph.scratch_len = graph.scratch_len.max(len);
            graph.nodes.push(Node {
                id,
                name: relation.name.clone(),
                shape: relation.shape.clone(),
                offset: graph.value_len,
                definition,
                parents,
                children: Vec::new(),
            });
            graph.value_len += len;
            graph.names.insert(relation.name.clone(), id);
        }

        log::debug!(
            "built model graph with {} nodes ({} stochastic, {} data)",
            graph.nodes.len(),
            graph.stochastic_nodes().len(),
            graph.data_nodes().len(),
        );
        Ok(graph)
    }

    fn resolve_expr(
        &self,
        node: &str,
        expr: &Expr<String>,
        declared: &HashSet<&str>,
    ) -> Result<Expr<NodeId>, GraphError> {
        expr.try_map_refs(&mut |name: &String| match self.names.get(name) {
            Some(&id) => Ok(id),
            None if declared.contains(name.as_str()) || name == node => {
                Err(GraphError::CyclicDependency {
                    node: node.to_string(),
                    reference: name.clone(),
                })
            }
            None => Err(GraphError::UnknownNode(name.clone())),
        })
    }

    fn expr_shape(&self, node: &str, expr: &Expr<NodeId>) -> Result<Shape, GraphError> {
        expr.infer_shape(&|id: &NodeId| self.nodes[id.0].shape.clone())
            .map_err(|err| shape_error(node, err))
    }

    fn resolve_definition(
        &mut self,
        relation: &Relation,
        declared: &HashSet<&str>,
        registry: &Registry,
    ) -> Result<Definition, GraphError> {
        let name = relation.name.as_str();
        let expected = relation.shape.len();
        match &relation.kind {
            RelationKind::Constant(value) => {
                if value.len() != expected {
                    return Err(shape_error(
                        name,
                        format!("value has {} elements, shape {} needs {}", value.len(), relation.shape, expected),
                    ));
                }
                Ok(Definition::Constant(value.clone()))
            }
            RelationKind::Deterministic(expr) => {
                let expr = self.resolve_expr(name, expr, declared)?;
                let shape = self.expr_shape(name, &expr)?;
                if shape != relation.shape && !(shape.is_scalar() && relation.shape.len() == 1) {
                    return Err(shape_error(
                        name,
                        format!("expression has shape {}, declared {}", shape, relation.shape),
                    ));
                }
                Ok(Definition::Deterministic(expr))
            }
            RelationKind::Stochastic {
                distribution,
                params,
                observed,
            } => {
                let supplied: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
                let resolved = registry.resolve_parameterization(distribution, &supplied)?;

                let mut user_exprs = HashMap::with_capacity(params.len());
                for (param, expr) in params {
                    user_exprs.insert(param.clone(), self.resolve_expr(name, expr, declared)?);
                }

                let mut canonical = Vec::with_capacity(resolved.canonical.len());
                let mut param_shapes = Vec::with_capacity(resolved.canonical.len());
                let mut param_ranges = Vec::with_capacity(resolved.canonical.len());
                for expr in resolved.canonical.iter() {
                    let expr = expr
                        .substitute(&|param: &String| user_exprs.get(param).cloned())
                        .ok_or_else(|| {
                            shape_error(name, format!("cannot map {} onto canonical parameters", expr))
                        })?
                        .simplify();
                    let shape = self.expr_shape(name, &expr)?;
                    param_ranges.push(self.param_len..self.param_len + shape.len());
                    self.param_len += shape.len();
                    param_shapes.push(shape);
                    canonical.push(expr);
                }
                resolved
                    .distribution
                    .check_shapes(&relation.shape, &param_shapes)
                    .map_err(|reason| shape_error(name, reason))?;

                if let Some(value) = observed {
                    if value.len() != expected {
                        return Err(shape_error(
                            name,
                            format!("observed value has {} elements, shape {} needs {}", value.len(), relation.shape, expected),
                        ));
                    }
                }

                Ok(Definition::Stochastic(StochasticDef {
                    distribution: resolved.distribution,
                    params: canonical,
                    param_shapes,
                    alternate: resolved.alternate,
                    data: observed.clone(),
                    param_ranges,
                }))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_id(&self, name: &str) -> Result<NodeId, GraphError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    pub fn node_ids(&self, names: &[&str]) -> Result<Vec<NodeId>, GraphError> {
        names.iter().map(|name| self.node_id(name)).collect()
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn names_of(&self, ids: &[NodeId]) -> Vec<&str> {
        ids.iter().map(|id| self.nodes[id.0].name.as_str()).collect()
    }

    /// Non-data stochastic nodes in declaration order.
    pub fn stochastic_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_stochastic() && !n.is_data())
            .map(|n| n.id)
            .collect()
    }

    pub fn data_nodes(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.is_data()).map(|n| n.id).collect()
    }

    pub fn parents(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].parents
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Non-data stochastic nodes without a stochastic ancestor.
    pub fn top_level_nodes(&self) -> Vec<NodeId> {
        let options = DependencyOptions {
            include_self: false,
            include_deterministic: false,
            ..Default::default()
        };
        self.stochastic_nodes()
            .into_iter()
            .filter(|&id| {
                !self
                    .get_dependencies(&[id], &options)
                    .iter()
                    .any(|other| self.nodes[other.0].is_stochastic())
            })
            .collect()
    }

    /// Non-data stochastic descendants reached through deterministic nodes
    /// only, plus data descendants.
    pub fn stochastic_dependents(&self, id: NodeId) -> Vec<NodeId> {
        let options = DependencyOptions {
            direction: Direction::Downstream,
            include_self: false,
            include_deterministic: false,
            stop_at_stochastic: true,
            ..Default::default()
        };
        self.get_dependencies(&[id], &options).ids().to_vec()
    }

    pub fn get_dependencies(&self, targets: &[NodeId], options: &DependencyOptions) -> DependencySet {
        deps::resolve(self, targets, options)
    }

    /// Fresh values: constants and data filled in, stochastic nodes at zero,
    /// deterministic nodes computed from those.
    pub fn new_values(&self) -> NodeValues {
        let mut values = NodeValues {
            values: vec![0.; self.value_len],
            params: vec![0.; self.param_len],
            logprob: vec![0.; self.nodes.len()],
            scratch: vec![0.; self.scratch_len],
        };
        for node in self.nodes.iter() {
            match &node.definition {
                Definition::Constant(value) => values.get_mut(node).copy_from_slice(value),
                Definition::Stochastic(StochasticDef {
                    data: Some(value), ..
                }) => values.get_mut(node).copy_from_slice(value),
                Definition::Deterministic(_) => self.recompute(&mut values, node.id),
                Definition::Stochastic(_) => {}
            }
        }
        values
    }

    pub fn env<'a>(&'a self, values: &'a NodeValues) -> GraphEnv<'a> {
        GraphEnv {
            graph: self,
            values: &values.values,
        }
    }

    /// Recompute a deterministic node from its parents. No-op for other kinds.
    pub fn recompute(&self, values: &mut NodeValues, id: NodeId) {
        let node = &self.nodes[id.0];
        let Definition::Deterministic(expr) = &node.definition else {
            return;
        };
        let len = node.shape.len();
        let env = GraphEnv {
            graph: self,
            values: &values.values,
        };
        expr.eval_into(&env, &mut values.scratch[..len]);
        values.values[node.range()].copy_from_slice(&values.scratch[..len]);
    }

    fn eval_params(&self, values: &mut NodeValues, def: &StochasticDef) {
        let env = GraphEnv {
            graph: self,
            values: &values.values,
        };
        for (expr, range) in def.params.iter().zip(def.param_ranges.iter()) {
            expr.eval_into(&env, &mut values.params[range.clone()]);
        }
    }

    /// Current canonical parameter values of a stochastic node.
    pub fn param_values<'a>(&self, values: &'a mut NodeValues, id: NodeId) -> Vec<&'a [f64]> {
        let Some(def) = self.nodes[id.0].stochastic() else {
            return Vec::new();
        };
        self.eval_params(values, def);
        def.param_ranges
            .iter()
            .map(|range| &values.params[range.clone()])
            .collect()
    }

    /// Log density of one stochastic node at its current value; caches it.
    pub fn node_log_prob(&self, values: &mut NodeValues, id: NodeId) -> f64 {
        let node = &self.nodes[id.0];
        let Some(def) = node.stochastic() else {
            return 0.;
        };
        self.eval_params(values, def);
        let params: Vec<&[f64]> = def
            .param_ranges
            .iter()
            .map(|range| &values.params[range.clone()])
            .collect();
        let logp = def
            .distribution
            .checked_log_density(&values.values[node.range()], &params);
        values.logprob[id.0] = logp;
        logp
    }

    /// Draw a value for one stochastic node from its distribution.
    pub fn sample_node(&self, values: &mut NodeValues, id: NodeId, rng: &mut dyn RngCore) {
        let node = &self.nodes[id.0];
        let Some(def) = node.stochastic() else {
            return;
        };
        self.eval_params(values, def);
        let params: Vec<&[f64]> = def
            .param_ranges
            .iter()
            .map(|range| &values.params[range.clone()])
            .collect();
        def.distribution
            .sample(&params, rng, &mut values.values[node.range()]);
    }

    /// Draw fresh values for the non-data stochastic nodes among `nodes`
    /// and recompute their deterministic descendants.
    pub fn simulate(&self, values: &mut NodeValues, nodes: &[NodeId], rng: &mut dyn RngCore) {
        self.simulate_with(values, nodes, false, rng)
    }

    /// Like `simulate`, optionally redrawing data nodes as well.
    pub fn simulate_with(
        &self,
        values: &mut NodeValues,
        nodes: &[NodeId],
        include_data: bool,
        rng: &mut dyn RngCore,
    ) {
        let targets: HashSet<NodeId> = nodes.iter().copied().collect();
        let set = self.get_dependencies(nodes, &DependencyOptions::markov_blanket());
        self.simulate_set(values, &set, |id| targets.contains(&id), include_data, rng);
    }

    /// Simulate over a precomputed Markov blanket set: draw the stochastic
    /// nodes selected by `is_target` and recompute deterministic nodes, in
    /// set order.
    pub fn simulate_set(
        &self,
        values: &mut NodeValues,
        set: &DependencySet,
        is_target: impl Fn(NodeId) -> bool,
        include_data: bool,
        rng: &mut dyn RngCore,
    ) {
        for id in set.iter() {
            let node = &self.nodes[id.0];
            match node.kind() {
                NodeKind::Deterministic => self.recompute(values, id),
                NodeKind::Stochastic if is_target(id) => {
                    if !node.is_data() || include_data {
                        self.sample_node(values, id, rng);
                    }
                }
                _ => {}
            }
        }
    }

    /// Sum of the log densities of the stochastic nodes among `nodes`.
    ///
    /// Uses current values without recomputing deterministic nodes. Each
    /// term is cached. A value outside its support contributes `-inf`.
    pub fn calculate_log_prob(&self, values: &mut NodeValues, nodes: &[NodeId]) -> f64 {
        nodes
            .iter()
            .map(|&id| self.node_log_prob(values, id))
            .sum()
    }

    /// Recompute the deterministic nodes of a dependency set in order and
    /// return the summed log-probability of its stochastic nodes.
    pub fn calculate(&self, values: &mut NodeValues, set: &DependencySet) -> f64 {
        let mut total = 0.;
        for &id in set.ids() {
            match self.nodes[id.0].kind() {
                NodeKind::Deterministic => self.recompute(values, id),
                NodeKind::Stochastic => total += self.node_log_prob(values, id),
                NodeKind::Constant => {}
            }
        }
        total
    }

    /// `calculate` minus the previously cached log-probability of the set.
    ///
    /// Returns `-inf` whenever the new log-probability is `-inf`.
    pub fn calculate_diff(&self, values: &mut NodeValues, set: &DependencySet) -> f64 {
        let old = self.get_log_prob(values, set);
        let new = self.calculate(values, set);
        if new == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        new - old
    }

    /// Sum of the cached log-probabilities of a dependency set.
    pub fn get_log_prob(&self, values: &NodeValues, set: &DependencySet) -> f64 {
        set.ids()
            .iter()
            .filter(|id| self.nodes[id.0].is_stochastic())
            .map(|id| values.logprob[id.0])
            .sum()
    }

    /// Evaluate a canonical or alternate parameter of a stochastic node.
    pub fn param(&self, values: &NodeValues, node: &str, name: &str) -> Result<Vec<f64>, GraphError> {
        let id = self.node_id(node)?;
        let unknown = || GraphError::UnknownParameter {
            node: node.to_string(),
            param: name.to_string(),
        };
        let def = self.nodes[id.0].stochastic().ok_or_else(unknown)?;
        let env = self.env(values);
        let canonical = def.distribution.params();
        if let Some(pos) = canonical.iter().position(|p| p.name == name) {
            return Ok(def.params[pos].eval_vec(&env));
        }
        let reported = def
            .distribution
            .alternates()
            .iter()
            .flat_map(|alt| alt.reported.iter())
            .find(|(n, _)| n == name)
            .map(|(_, expr)| expr)
            .ok_or_else(unknown)?;
        let expr = reported
            .substitute(&|p: &String| {
                canonical
                    .iter()
                    .position(|c| &c.name == p)
                    .map(|pos| def.params[pos].clone())
            })
            .ok_or_else(unknown)?;
        Ok(expr.eval_vec(&env))
    }
}

/// A graph together with one set of values.
///
/// Cloning gives an independent copy of the values sharing the same graph.
#[derive(Debug, Clone)]
pub struct Model {
    graph: Arc<ModelGraph>,
    values: NodeValues,
}

impl Model {
    pub fn new(graph: Arc<ModelGraph>) -> Self {
        let values = graph.new_values();
        Model { graph, values }
    }

    pub fn build(
        relations: impl IntoIterator<Item = Relation>,
        registry: &Registry,
    ) -> Result<Self, GraphError> {
        Ok(Model::new(Arc::new(ModelGraph::build(relations, registry)?)))
    }

    pub fn graph(&self) -> &Arc<ModelGraph> {
        &self.graph
    }

    pub fn values(&self) -> &NodeValues {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut NodeValues {
        &mut self.values
    }

    pub fn into_parts(self) -> (Arc<ModelGraph>, NodeValues) {
        (self.graph, self.values)
    }

    pub fn value(&self, name: &str) -> Result<&[f64], GraphError> {
        let id = self.graph.node_id(name)?;
        Ok(self.values.get(self.graph.node(id)))
    }

    /// Overwrite the value of a node. Deterministic descendants are left
    /// stale until the next `calculate`.
    pub fn set_value(&mut self, name: &str, value: &[f64]) -> Result<(), GraphError> {
        let id = self.graph.node_id(name)?;
        let node = self.graph.node(id);
        if value.len() != node.shape.len() {
            return Err(shape_error(
                name,
                format!("value has {} elements, shape {} needs {}", value.len(), node.shape, node.shape.len()),
            ));
        }
        self.values.get_mut(node).copy_from_slice(value);
        Ok(())
    }

    pub fn simulate(&mut self, names: &[&str], rng: &mut dyn RngCore) -> Result<(), GraphError> {
        let ids = self.graph.node_ids(names)?;
        self.graph.simulate(&mut self.values, &ids, rng);
        Ok(())
    }

    pub fn calculate_log_prob(&mut self, names: &[&str]) -> Result<f64, GraphError> {
        let ids = self.graph.node_ids(names)?;
        Ok(self.graph.calculate_log_prob(&mut self.values, &ids))
    }

    pub fn calculate(&mut self, set: &DependencySet) -> f64 {
        self.graph.calculate(&mut self.values, set)
    }

    pub fn get_dependencies(
        &self,
        names: &[&str],
        options: &DependencyOptions,
    ) -> Result<DependencySet, GraphError> {
        let ids = self.graph.node_ids(names)?;
        Ok(self.graph.get_dependencies(&ids, options))
    }

    pub fn param(&self, node: &str, name: &str) -> Result<Vec<f64>, GraphError> {
        self.graph.param(&self.values, node, name)
    }
}
