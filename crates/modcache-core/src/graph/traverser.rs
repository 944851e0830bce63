//! Platform-aware queries over a [`Graph`].
//!
//! An edge `from → to` means "`from` depends on `to`": `to` must be hashed
//! and resolved before `from`. Adjacency lists are computed once per
//! traverser and kept sorted by node identity, so every query below is
//! deterministic.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use crate::graph::error::{GraphError, GraphResult};
use crate::graph::model::{Graph, Node, NodeId, Platform};

/// Selection criteria for [`GraphTraverser::filter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    /// Always selected, regardless of tags or test plan.
    pub names: BTreeSet<NodeId>,
    /// When non-empty, a node must carry at least one of these tags.
    pub include_tags: BTreeSet<String>,
    pub exclude_tags: BTreeSet<String>,
    /// Restricts the selection to the nodes of a test plan.
    pub test_plan: Option<BTreeSet<NodeId>>,
}

impl NodeFilter {
    pub fn selects(&self, node: &Node) -> bool {
        if self.names.contains(&node.id) {
            return true;
        }
        if node.tags.iter().any(|tag| self.exclude_tags.contains(tag)) {
            return false;
        }
        let tagged = self.include_tags.is_empty()
            || node.tags.iter().any(|tag| self.include_tags.contains(tag));
        let planned = self
            .test_plan
            .as_ref()
            .map_or(true, |plan| plan.contains(&node.id));
        tagged && planned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Read-only view of a graph under one build platform.
#[derive(Debug, Clone)]
pub struct GraphTraverser<'g> {
    graph: &'g Graph,
    platform: Option<Platform>,
    /// `node → its dependencies`, sorted by identity.
    dependencies: Vec<Vec<usize>>,
    /// `node → its dependents`, sorted by identity.
    dependents: Vec<Vec<usize>>,
    /// Arena indices sorted by identity.
    ordered: Vec<usize>,
}

impl<'g> GraphTraverser<'g> {
    /// Build the active adjacency for `platform`. With no platform every
    /// conditional edge counts as active.
    pub fn new(graph: &'g Graph, platform: Option<Platform>) -> Self {
        let len = graph.len();
        let mut dependencies = vec![Vec::new(); len];
        let mut dependents = vec![Vec::new(); len];

        for slot in graph.edge_slots() {
            let active = slot
                .condition
                .as_ref()
                .map_or(true, |condition| condition.is_active_for(platform.as_ref()));
            if active {
                dependencies[slot.from].push(slot.to);
                dependents[slot.to].push(slot.from);
            }
        }

        let by_id = |a: &usize, b: &usize| graph.node_at(*a).id.cmp(&graph.node_at(*b).id);
        for list in dependencies.iter_mut().chain(dependents.iter_mut()) {
            list.sort_by(by_id);
            list.dedup();
        }
        let mut ordered: Vec<usize> = (0..len).collect();
        ordered.sort_by(by_id);

        Self {
            graph,
            platform,
            dependencies,
            dependents,
            ordered,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn node(&self, id: &NodeId) -> GraphResult<&'g Node> {
        let idx = self.graph.index_of(id)?;
        Ok(self.graph.node_at(idx))
    }

    /// All nodes, sorted by identity.
    pub fn nodes(&self) -> impl Iterator<Item = &'g Node> + '_ {
        self.ordered.iter().map(|&idx| self.graph.node_at(idx))
    }

    pub fn direct_dependencies(&self, id: &NodeId) -> GraphResult<Vec<&'g Node>> {
        let idx = self.graph.index_of(id)?;
        Ok(self.resolve_all(&self.dependencies[idx]))
    }

    pub fn direct_dependents(&self, id: &NodeId) -> GraphResult<Vec<&'g Node>> {
        let idx = self.graph.index_of(id)?;
        Ok(self.resolve_all(&self.dependents[idx]))
    }

    /// Every node reachable from `id` through dependency edges, excluding
    /// `id` itself.
    pub fn transitive_dependencies(&self, id: &NodeId) -> GraphResult<BTreeSet<NodeId>> {
        let idx = self.graph.index_of(id)?;
        Ok(self.reachable(idx, &self.dependencies))
    }

    /// Every node that depends on `id`, directly or not.
    pub fn transitive_dependents(&self, id: &NodeId) -> GraphResult<BTreeSet<NodeId>> {
        let idx = self.graph.index_of(id)?;
        Ok(self.reachable(idx, &self.dependents))
    }

    /// Nodes no other node depends on.
    pub fn roots(&self) -> Vec<&'g Node> {
        self.ordered
            .iter()
            .filter(|&&idx| self.dependents[idx].is_empty())
            .map(|&idx| self.graph.node_at(idx))
            .collect()
    }

    /// Nodes without dependencies.
    pub fn leaves(&self) -> Vec<&'g Node> {
        self.ordered
            .iter()
            .filter(|&&idx| self.dependencies[idx].is_empty())
            .map(|&idx| self.graph.node_at(idx))
            .collect()
    }

    /// First cycle found by a three-colour DFS in identity order, as the
    /// grey path from the back-edge target to its source.
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut marks = vec![Mark::White; self.graph.len()];
        for &start in &self.ordered {
            if marks[start] != Mark::White {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut marks) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|idx| self.graph.node_at(idx).id.clone())
                        .collect(),
                );
            }
        }
        None
    }

    /// DFS from `start` with an explicit stack of
    /// `(node, next dependency position)` frames.
    fn visit(&self, start: usize, marks: &mut [Mark]) -> Option<Vec<usize>> {
        marks[start] = Mark::Grey;
        let mut frames = vec![(start, 0usize)];
        while let Some(frame) = frames.last_mut() {
            let (node, cursor) = *frame;
            let Some(&next) = self.dependencies[node].get(cursor) else {
                marks[node] = Mark::Black;
                frames.pop();
                continue;
            };
            frame.1 += 1;
            match marks[next] {
                Mark::Grey => {
                    let from = frames.iter().position(|&(idx, _)| idx == next)?;
                    return Some(frames[from..].iter().map(|&(idx, _)| idx).collect());
                }
                Mark::White => {
                    marks[next] = Mark::Grey;
                    frames.push((next, 0));
                }
                Mark::Black => {}
            }
        }
        None
    }

    /// Dependencies-first ordering of the whole graph.
    ///
    /// Returns [`GraphError::CycleDetected`] when the active subgraph is not
    /// a DAG.
    pub fn topological_order(&self) -> GraphResult<TopologicalOrder<'_, 'g>> {
        match self.find_cycle() {
            Some(path) => Err(GraphError::CycleDetected { path }),
            None => Ok(TopologicalOrder { traverser: self }),
        }
    }

    /// Identities of the nodes selected by `filter`.
    pub fn filter(&self, filter: &NodeFilter) -> BTreeSet<NodeId> {
        self.nodes()
            .filter(|node| filter.selects(node))
            .map(|node| node.id.clone())
            .collect()
    }

    pub(crate) fn index_of(&self, id: &NodeId) -> GraphResult<usize> {
        self.graph.index_of(id)
    }

    pub(crate) fn node_at(&self, idx: usize) -> &'g Node {
        self.graph.node_at(idx)
    }

    pub(crate) fn dependency_indices(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    pub(crate) fn dependent_indices(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Arena indices reachable from `idx` (inclusive) through dependencies.
    pub(crate) fn closure_indices(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([idx]);
        while let Some(current) = queue.pop_front() {
            if seen.insert(current) {
                queue.extend(self.dependencies[current].iter().copied());
            }
        }
        seen
    }

    fn resolve_all(&self, indices: &[usize]) -> Vec<&'g Node> {
        indices.iter().map(|&idx| self.graph.node_at(idx)).collect()
    }

    fn reachable(&self, idx: usize, adjacency: &[Vec<usize>]) -> BTreeSet<NodeId> {
        let mut seen = vec![false; self.graph.len()];
        let mut queue: VecDeque<usize> = adjacency[idx].iter().copied().collect();
        let mut found = BTreeSet::new();
        while let Some(current) = queue.pop_front() {
            if current == idx || seen[current] {
                continue;
            }
            seen[current] = true;
            found.insert(self.graph.node_at(current).id.clone());
            queue.extend(adjacency[current].iter().copied());
        }
        found
    }
}

/// Lazy, restartable topological order of an acyclic traverser.
#[derive(Debug, Clone, Copy)]
pub struct TopologicalOrder<'t, 'g> {
    traverser: &'t GraphTraverser<'g>,
}

impl<'t, 'g> TopologicalOrder<'t, 'g> {
    /// Start a fresh pass of Kahn's algorithm. Ties are broken by smallest
    /// identity.
    pub fn iter(&self) -> TopologicalIter<'t, 'g> {
        let traverser = self.traverser;
        let pending: Vec<usize> = traverser
            .dependencies
            .iter()
            .map(Vec::len)
            .collect();
        let ready = pending
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(idx, _)| Reverse((&traverser.graph.node_at(idx).id, idx)))
            .collect();
        TopologicalIter {
            traverser,
            pending,
            ready,
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|node| node.id.clone()).collect()
    }
}

impl<'t, 'g> IntoIterator for &TopologicalOrder<'t, 'g> {
    type Item = &'g Node;
    type IntoIter = TopologicalIter<'t, 'g>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over a [`TopologicalOrder`].
#[derive(Debug)]
pub struct TopologicalIter<'t, 'g> {
    traverser: &'t GraphTraverser<'g>,
    pending: Vec<usize>,
    ready: BinaryHeap<Reverse<(&'g NodeId, usize)>>,
}

impl<'t, 'g> Iterator for TopologicalIter<'t, 'g> {
    type Item = &'g Node;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((_, idx)) = self.ready.pop()?;
        for &dependent in &self.traverser.dependents[idx] {
            self.pending[dependent] -= 1;
            if self.pending[dependent] == 0 {
                self.ready
                    .push(Reverse((&self.traverser.graph.node_at(dependent).id, dependent)));
            }
        }
        Some(self.traverser.graph.node_at(idx))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ready.len(), Some(self.pending.len()))
    }
}
