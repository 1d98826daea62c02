use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
};

use crate::graph::{ModelGraph, NodeId, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards parents.
    Upstream,
    /// Towards children.
    Downstream,
    Both,
}

/// What `ModelGraph::get_dependencies` follows and returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyOptions {
    pub direction: Direction,
    /// Keep the targets themselves in the result.
    pub include_self: bool,
    pub include_stochastic: bool,
    pub include_deterministic: bool,
    pub include_data: bool,
    /// When walking downstream, do not continue past a stochastic node that
    /// is not itself a target.
    pub stop_at_stochastic: bool,
}

impl Default for DependencyOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Upstream,
            include_self: true,
            include_stochastic: true,
            include_deterministic: true,
            include_data: true,
            stop_at_stochastic: false,
        }
    }
}

impl DependencyOptions {
    /// The targets, their deterministic descendants and their first
    /// stochastic descendants. This is the set a sampler recalculates.
    pub fn markov_blanket() -> Self {
        Self {
            direction: Direction::Downstream,
            stop_at_stochastic: true,
            ..Default::default()
        }
    }
}

/// Node ids ordered parents before children, ties in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencySet(Vec<NodeId>);

impl DependencySet {
    pub fn ids(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter().copied()
    }

    /// Restrict to the nodes matching `keep`, preserving order.
    pub fn filter(&self, keep: impl Fn(NodeId) -> bool) -> DependencySet {
        DependencySet(self.iter().filter(|&id| keep(id)).collect())
    }
}

fn walk(
    graph: &ModelGraph,
    targets: &[NodeId],
    downstream: bool,
    stop_at_stochastic: bool,
    visited: &mut [bool],
    is_target: &[bool],
) {
    let mut queue: VecDeque<NodeId> = targets.iter().copied().collect();
    for id in targets {
        visited[id.0] = true;
    }
    while let Some(id) = queue.pop_front() {
        let node = graph.node(id);
        if downstream && stop_at_stochastic && node.is_stochastic() && !is_target[id.0] {
            continue;
        }
        let next = if downstream {
            node.children()
        } else {
            node.parents()
        };
        for &other in next {
            if !visited[other.0] {
                visited[other.0] = true;
                queue.push_back(other);
            }
        }
    }
}

#[cfg(test)]
thread_local! {
    static RESOLVE_CALLS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Number of `resolve` calls made on this thread.
#[cfg(test)]
pub(crate) fn resolve_calls() -> usize {
    RESOLVE_CALLS.with(|calls| calls.get())
}

/// Breadth-first closure of `targets`, topologically sorted.
///
/// The graph is acyclic by construction, so the sort always consumes every
/// visited node.
pub fn resolve(graph: &ModelGraph, targets: &[NodeId], options: &DependencyOptions) -> DependencySet {
    #[cfg(test)]
    RESOLVE_CALLS.with(|calls| calls.set(calls.get() + 1));

    let n = graph.len();
    let mut is_target = vec![false; n];
    for id in targets {
        is_target[id.0] = true;
    }

    // Each direction starts from the full target set with its own marks.
    let mut visited = vec![false; n];
    if matches!(options.direction, Direction::Upstream | Direction::Both) {
        walk(graph, targets, false, options.stop_at_stochastic, &mut visited, &is_target);
    }
    if matches!(options.direction, Direction::Downstream | Direction::Both) {
        let mut below = vec![false; n];
        walk(graph, targets, true, options.stop_at_stochastic, &mut below, &is_target);
        for (seen, reached) in visited.iter_mut().zip(below) {
            *seen |= reached;
        }
    }

    // Kahn's algorithm on the visited subgraph, smallest declaration index
    // first among ready nodes.
    let mut in_degree = vec![0usize; n];
    let mut ready = BinaryHeap::new();
    for id in (0..n).filter(|&i| visited[i]).map(NodeId) {
        in_degree[id.0] = graph.parents(id).iter().filter(|p| visited[p.0]).count();
        if in_degree[id.0] == 0 {
            ready.push(Reverse(id));
        }
    }
    let mut order = Vec::with_capacity(visited.iter().filter(|&&v| v).count());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for &child in graph.children(id) {
            if visited[child.0] {
                in_degree[child.0] -= 1;
                if in_degree[child.0] == 0 {
                    ready.push(Reverse(child));
                }
            }
        }
    }

    let keep = |id: NodeId| {
        if is_target[id.0] {
            return options.include_self;
        }
        let node = graph.node(id);
        match node.kind() {
            NodeKind::Constant => true,
            NodeKind::Deterministic => options.include_deterministic,
            NodeKind::Stochastic if node.is_data() => options.include_data,
            NodeKind::Stochastic => options.include_stochastic,
        }
    };
    DependencySet(order.into_iter().filter(|&id| keep(id)).collect())
}
