//! Immutable graph snapshot: an arena of nodes plus an index-pair edge table.
//!
//! Nodes never hold references to each other. Edges are stored as pairs of
//! arena indices, so a [`Graph`] is plain data: `Clone`, `Send` and `Sync`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

use modcache_store::Fingerprint;
use serde::{Deserialize, Serialize};

use crate::graph::error::{GraphError, GraphResult};

/// Stable identity of a buildable unit: its container path plus its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Directory of the declaring project, `/`-separated, relative to the
    /// workspace root.
    pub container: String,
    pub name: String,
}

impl NodeId {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.name)
    }
}

impl std::str::FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((container, name)) if !name.is_empty() => Ok(NodeId::new(container, name)),
            _ => Err(format!("malformed node id: {s}")),
        }
    }
}

/// What a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Application,
    Library,
    Framework,
    StaticLibrary,
    Bundle,
    UnitTests,
    UiTests,
    Tool,
}

impl NodeKind {
    pub fn is_test(self) -> bool {
        matches!(self, NodeKind::UnitTests | NodeKind::UiTests)
    }

    /// Kinds whose build output can be substituted by a cached binary.
    pub fn is_cacheable_by_default(self) -> bool {
        matches!(
            self,
            NodeKind::Library | NodeKind::Framework | NodeKind::StaticLibrary | NodeKind::Bundle
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Application => "application",
            NodeKind::Library => "library",
            NodeKind::Framework => "framework",
            NodeKind::StaticLibrary => "static_library",
            NodeKind::Bundle => "bundle",
            NodeKind::UnitTests => "unit_tests",
            NodeKind::UiTests => "ui_tests",
            NodeKind::Tool => "tool",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target platform of a build context, e.g. `ios` or `linux`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Platform(String);

impl Platform {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platforms for which a conditional edge is active.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformCondition(BTreeSet<Platform>);

impl PlatformCondition {
    pub fn new<I, P>(platforms: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        Self(platforms.into_iter().map(Platform::new).collect())
    }

    /// With no build platform every conditional edge counts as active.
    pub fn is_active_for(&self, platform: Option<&Platform>) -> bool {
        match platform {
            None => true,
            Some(platform) => self.0.contains(platform),
        }
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.0.iter()
    }
}

/// Whether a node is built from source or substituted by a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeOrigin {
    #[default]
    Source,
    Prebuilt {
        fingerprint: Fingerprint,
        /// Path of the cached artifact in the local tier.
        location: String,
    },
}

/// A buildable or testable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Source files, relative to the node's container.
    pub sources: Vec<PathBuf>,
    /// Resource files, relative to the node's container.
    pub resources: Vec<PathBuf>,
    /// Build settings that influence the produced artifact.
    pub settings: BTreeMap<String, serde_json::Value>,
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub origin: NodeOrigin,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            sources: Vec::new(),
            resources: Vec::new(),
            settings: BTreeMap::new(),
            tags: BTreeSet::new(),
            origin: NodeOrigin::Source,
        }
    }

    pub fn with_sources<I, P>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn with_resources<I, P>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.resources.extend(resources.into_iter().map(Into::into));
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn is_prebuilt(&self) -> bool {
        matches!(self.origin, NodeOrigin::Prebuilt { .. })
    }
}

/// Directed dependency: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub condition: Option<PlatformCondition>,
}

impl Edge {
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            condition: None,
        }
    }

    /// Restrict the edge to the given platforms.
    pub fn when(mut self, condition: PlatformCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn is_active_for(&self, platform: Option<&Platform>) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |condition| condition.is_active_for(platform))
    }
}

/// Name and version of one graph snapshot; memoised fingerprints are keyed
/// by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub name: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EdgeSlot {
    pub(crate) from: usize,
    pub(crate) to: usize,
    pub(crate) condition: Option<PlatformCondition>,
}

/// A validated, immutable graph snapshot.
#[derive(Debug, Clone)]
pub struct Graph {
    snapshot: GraphSnapshot,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    edges: Vec<EdgeSlot>,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    pub fn snapshot(&self) -> &GraphSnapshot {
        &self.snapshot
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.edges.iter().map(|slot| Edge {
            from: self.nodes[slot.from].id.clone(),
            to: self.nodes[slot.to].id.clone(),
            condition: slot.condition.clone(),
        })
    }

    pub(crate) fn index_of(&self, id: &NodeId) -> GraphResult<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))
    }

    pub(crate) fn node_at(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub(crate) fn edge_slots(&self) -> &[EdgeSlot] {
        &self.edges
    }

    /// New snapshot (version + 1) in which the given nodes are marked as
    /// substituted by cached artifacts. Unknown ids are ignored.
    pub fn with_prebuilt(&self, prebuilt: &BTreeMap<NodeId, (Fingerprint, String)>) -> Graph {
        let mut next = self.clone();
        next.snapshot.version += 1;
        for (id, (fingerprint, location)) in prebuilt {
            if let Some(&idx) = next.index.get(id) {
                next.nodes[idx].origin = NodeOrigin::Prebuilt {
                    fingerprint: *fingerprint,
                    location: location.clone(),
                };
            }
        }
        next
    }
}

/// Accumulates nodes and edges and validates them into a [`Graph`].
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    snapshot: GraphSnapshot,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            snapshot: GraphSnapshot {
                name: name.into(),
                version: 1,
            },
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn version(mut self, version: u64) -> Self {
        self.snapshot.version = version;
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// `from` depends on `to`.
    pub fn edge(mut self, from: &NodeId, to: &NodeId) -> Self {
        self.edges.push(Edge::new(from.clone(), to.clone()));
        self
    }

    pub fn conditional_edge(
        mut self,
        from: &NodeId,
        to: &NodeId,
        condition: PlatformCondition,
    ) -> Self {
        self.edges
            .push(Edge::new(from.clone(), to.clone()).when(condition));
        self
    }

    pub fn build(self) -> GraphResult<Graph> {
        let mut index = HashMap::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.id.name.is_empty() || node.id.name.contains(':') {
                return Err(GraphError::InvalidName(node.id.clone()));
            }
            if index.insert(node.id.clone(), idx).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let mut edges = Vec::with_capacity(self.edges.len());
        for edge in self.edges {
            let from = *index
                .get(&edge.from)
                .ok_or_else(|| GraphError::UnknownNode(edge.from.clone()))?;
            let to = *index
                .get(&edge.to)
                .ok_or_else(|| GraphError::UnknownNode(edge.to.clone()))?;
            edges.push(EdgeSlot {
                from,
                to,
                condition: edge.condition,
            });
        }

        Ok(Graph {
            snapshot: self.snapshot,
            nodes: self.nodes,
            index,
            edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lib(name: &str) -> Node {
        Node::new(NodeId::new("Modules", name), NodeKind::Library)
    }

    #[test]
    fn builder_rejects_duplicate_nodes() {
        let result = Graph::builder("dup").node(lib("A")).node(lib("A")).build();
        assert!(matches!(result, Err(GraphError::DuplicateNode(_))));
    }

    #[test]
    fn builder_rejects_edges_to_unknown_nodes() {
        let a = NodeId::new("Modules", "A");
        let ghost = NodeId::new("Modules", "Ghost");
        let result = Graph::builder("g").node(lib("A")).edge(&a, &ghost).build();
        assert_eq!(result.unwrap_err(), GraphError::UnknownNode(ghost));
    }

    #[test]
    fn node_lookup_by_identity() {
        let graph = Graph::builder("g").node(lib("A")).node(lib("B")).build().unwrap();
        let b = graph.node(&NodeId::new("Modules", "B")).unwrap();
        assert_eq!(b.kind, NodeKind::Library);
        assert!(graph.node(&NodeId::new("Other", "B")).is_none());
    }

    #[test]
    fn node_id_parses_display_form() {
        let id: NodeId = "Projects/App:App".parse().unwrap();
        assert_eq!(id, NodeId::new("Projects/App", "App"));
        assert!("no-separator".parse::<NodeId>().is_err());
    }

    #[test]
    fn builder_rejects_names_that_do_not_round_trip() {
        let result = Graph::builder("g").node(lib("Core:Tests")).build();
        assert_eq!(
            result.unwrap_err(),
            GraphError::InvalidName(NodeId::new("Modules", "Core:Tests"))
        );
        assert!(matches!(
            Graph::builder("g").node(lib("")).build(),
            Err(GraphError::InvalidName(_))
        ));
    }

    #[test]
    fn accepted_ids_round_trip_through_display() {
        let graph = Graph::builder("g")
            .node(Node::new(NodeId::new("C:/Projects/App", "App"), NodeKind::Application))
            .node(lib("Core"))
            .build()
            .unwrap();
        for node in graph.nodes() {
            let parsed: NodeId = node.id.to_string().parse().unwrap();
            assert_eq!(parsed, node.id);
        }
    }

    #[test]
    fn platform_condition_matches_case_insensitively() {
        let condition = PlatformCondition::new(["iOS", "tvOS"]);
        assert!(condition.is_active_for(Some(&Platform::new("ios"))));
        assert!(!condition.is_active_for(Some(&Platform::new("macos"))));
        assert!(condition.is_active_for(None));
    }

    #[test]
    fn with_prebuilt_bumps_version_and_marks_nodes() {
        let graph = Graph::builder("g").node(lib("A")).node(lib("B")).build().unwrap();
        let a = NodeId::new("Modules", "A");
        let fp = Fingerprint::from_digest(modcache_store::Digest::compute(b"a"));
        let mut prebuilt = BTreeMap::new();
        prebuilt.insert(a.clone(), (fp, "/cache/a".to_string()));

        let resolved = graph.with_prebuilt(&prebuilt);

        assert_eq!(resolved.snapshot().version, graph.snapshot().version + 1);
        assert!(resolved.node(&a).unwrap().is_prebuilt());
        assert!(!graph.node(&a).unwrap().is_prebuilt());
        assert!(!resolved
            .node(&NodeId::new("Modules", "B"))
            .unwrap()
            .is_prebuilt());
    }
}
