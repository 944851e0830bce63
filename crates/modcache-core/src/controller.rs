//! Cache resolution over a whole graph.
//!
//! Each node is hashed once its dependencies are hashed, then looked up in
//! the [`CacheStore`]. Cache failures only ever downgrade the affected node
//! to a rebuild; hashing failures, cycles and cancellation abort the run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use modcache_store::{
    Artifact, CacheEntry, CacheError, CacheStore, Fingerprint, Materialized, Tier,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn, Instrument};
use uuid::Uuid;

use crate::graph::{Graph, GraphError, GraphTraverser, Node, NodeId, NodeKind, Platform};
use crate::hasher::{ContentHasher, HashError};
use crate::metrics::CacheMetrics;
use crate::obs;
use crate::schedule::{run_ready_queue, CancelSignal, ReadyNode, ScheduleError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Hash(HashError),

    #[error("resolution cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] CacheError),

    #[error("resolution task failed: {0}")]
    Join(String),
}

impl From<HashError> for ControllerError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Cancelled => ControllerError::Cancelled,
            HashError::Graph(err) => ControllerError::Graph(err),
            other => ControllerError::Hash(other),
        }
    }
}

impl From<ScheduleError> for ControllerError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Cancelled => ControllerError::Cancelled,
            ScheduleError::Join(reason) => ControllerError::Join(reason),
            ScheduleError::Graph(err) => ControllerError::Graph(err),
        }
    }
}

pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

/// Why a node has to be built from source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum BuildReason {
    CacheMiss,
    NotCacheable,
    TransportError(String),
    FetchFailed(String),
}

/// Terminal state of a node after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Fetched,
    BuildRequired(BuildReason),
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Fetched => "fetched",
            NodeState::BuildRequired(BuildReason::CacheMiss) => "cache_miss",
            NodeState::BuildRequired(BuildReason::NotCacheable) => "not_cacheable",
            NodeState::BuildRequired(BuildReason::TransportError(_)) => "transport_error",
            NodeState::BuildRequired(BuildReason::FetchFailed(_)) => "fetch_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_concurrency: usize,
    /// Node kinds whose artifacts may come from the cache.
    pub cacheable: BTreeSet<NodeKind>,
}

/// Available parallelism, capped at 8.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            cacheable: [
                NodeKind::Application,
                NodeKind::Library,
                NodeKind::Framework,
                NodeKind::StaticLibrary,
                NodeKind::Bundle,
                NodeKind::UnitTests,
                NodeKind::UiTests,
                NodeKind::Tool,
            ]
            .into_iter()
            .filter(|kind| kind.is_cacheable_by_default())
            .collect(),
        }
    }
}

/// Outcome of [`CacheController::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub invocation_id: Uuid,
    /// The input graph with every fetched node marked prebuilt.
    pub resolved_graph: Graph,
    pub build_required: BTreeSet<NodeId>,
    pub states: BTreeMap<NodeId, NodeState>,
    pub fingerprints: BTreeMap<NodeId, Fingerprint>,
    /// Cache entries of the fetched nodes.
    pub prebuilt: BTreeMap<NodeId, CacheEntry>,
}

impl Resolution {
    pub fn state(&self, id: &NodeId) -> Option<&NodeState> {
        self.states.get(id)
    }

    pub fn fetched(&self) -> impl Iterator<Item = &NodeId> {
        self.prebuilt.keys()
    }
}

/// Builds the artifact of one node for [`CacheController::warm`].
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, node: &Node, fingerprint: &Fingerprint) -> anyhow::Result<Artifact>;
}

/// Outcome of [`CacheController::warm`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmReport {
    /// Nodes that were already in the cache.
    pub cached: BTreeSet<NodeId>,
    pub built: BTreeMap<NodeId, Fingerprint>,
    /// Built nodes whose artifact also reached the remote tier.
    pub uploaded: BTreeSet<NodeId>,
    pub failed: BTreeMap<NodeId, String>,
    /// Nodes of kinds that are never cached.
    pub skipped: BTreeSet<NodeId>,
}

#[derive(Debug, Clone)]
struct NodeOutcome {
    fingerprint: Fingerprint,
    state: NodeState,
    entry: Option<CacheEntry>,
}

/// Resolves graphs against the cache and warms it.
#[derive(Debug)]
pub struct CacheController {
    hasher: ContentHasher,
    store: Arc<CacheStore>,
    config: ControllerConfig,
    metrics: Arc<CacheMetrics>,
}

impl CacheController {
    pub fn new(
        hasher: ContentHasher,
        store: Arc<CacheStore>,
        config: ControllerConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            hasher,
            store,
            config,
            metrics,
        }
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Hash every node and look it up in the cache.
    pub async fn resolve(
        &self,
        graph: &Graph,
        platform: Option<Platform>,
        cancel: &CancelSignal,
    ) -> ControllerResult<Resolution> {
        let span = obs::ResolveSpan::new_invocation();
        self.resolve_invocation(span.invocation_id(), graph, platform, cancel)
            .instrument(span.span().clone())
            .await
    }

    #[instrument(
        skip_all,
        fields(graph = %graph.snapshot().name, version = graph.snapshot().version)
    )]
    async fn resolve_invocation(
        &self,
        invocation_id: Uuid,
        graph: &Graph,
        platform: Option<Platform>,
        cancel: &CancelSignal,
    ) -> ControllerResult<Resolution> {
        let started = Instant::now();
        let traverser = GraphTraverser::new(graph, platform);
        traverser.topological_order()?;
        obs::emit_resolve_started(&graph.snapshot().name, graph.len());

        let outcomes = run_ready_queue(
            &traverser,
            self.config.max_concurrency,
            cancel,
            |ready: ReadyNode<NodeOutcome>| {
                let hasher = self.hasher.clone();
                let store = Arc::clone(&self.store);
                let metrics = Arc::clone(&self.metrics);
                let cacheable = self.config.cacheable.contains(&ready.node.kind);
                let key = ContentHasher::memo_key(&traverser, &ready.node.id);
                async move {
                    let deps: Vec<Fingerprint> = ready
                        .dependencies
                        .iter()
                        .map(|(_, outcome)| outcome.fingerprint)
                        .collect();
                    let fingerprint = hasher
                        .memoised_fingerprint(key, &ready.node, &deps)
                        .await?;
                    let (state, entry) = if cacheable {
                        lookup(&store, &metrics, &ready.node.id, &fingerprint).await
                    } else {
                        (NodeState::BuildRequired(BuildReason::NotCacheable), None)
                    };
                    obs::emit_node_resolved(&ready.node.id, &fingerprint.short(), state.as_str());
                    Ok::<_, ControllerError>(NodeOutcome {
                        fingerprint,
                        state,
                        entry,
                    })
                }
            },
        )
        .await?;

        let mut resolution = Resolution {
            invocation_id,
            resolved_graph: graph.clone(),
            build_required: BTreeSet::new(),
            states: BTreeMap::new(),
            fingerprints: BTreeMap::new(),
            prebuilt: BTreeMap::new(),
        };
        for (id, outcome) in outcomes {
            resolution.fingerprints.insert(id.clone(), outcome.fingerprint);
            if let Some(entry) = outcome.entry {
                resolution.prebuilt.insert(id.clone(), entry);
            }
            if matches!(outcome.state, NodeState::BuildRequired(_)) {
                resolution.build_required.insert(id.clone());
            }
            resolution.states.insert(id, outcome.state);
        }

        let substitutions = resolution
            .prebuilt
            .iter()
            .map(|(id, entry)| (id.clone(), (entry.fingerprint, entry.location.clone())))
            .collect();
        resolution.resolved_graph = graph.with_prebuilt(&substitutions);

        obs::emit_resolve_finished(
            &graph.snapshot().name,
            resolution.prebuilt.len(),
            resolution.build_required.len(),
            started.elapsed().as_millis() as u64,
        );
        self.metrics.flush();
        Ok(resolution)
    }

    /// Resolve, then build and store every cacheable node that missed.
    ///
    /// A failed build is recorded and the walk continues; a failure to store
    /// into the local tier aborts with [`ControllerError::Store`].
    #[instrument(skip_all, fields(graph = %graph.snapshot().name))]
    pub async fn warm(
        &self,
        graph: &Graph,
        platform: Option<Platform>,
        builder: &dyn ArtifactBuilder,
        cancel: &CancelSignal,
    ) -> ControllerResult<WarmReport> {
        let resolution = self.resolve(graph, platform.clone(), cancel).await?;
        let traverser = GraphTraverser::new(graph, platform);
        let order = traverser.topological_order()?;

        let mut report = WarmReport {
            cached: resolution.prebuilt.keys().cloned().collect(),
            ..WarmReport::default()
        };

        for node in order.iter() {
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled);
            }
            match resolution.state(&node.id) {
                Some(NodeState::BuildRequired(BuildReason::NotCacheable)) => {
                    report.skipped.insert(node.id.clone());
                    continue;
                }
                Some(NodeState::BuildRequired(_)) => {}
                _ => continue,
            }
            let Some(fingerprint) = resolution.fingerprints.get(&node.id).copied() else {
                continue;
            };

            let artifact = match builder.build(node, &fingerprint).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    let reason = format!("{e:#}");
                    warn!(node = %node.id, error = %reason, "build failed");
                    report.failed.insert(node.id.clone(), reason);
                    continue;
                }
            };
            let outcome = self.store.store(&fingerprint, &artifact).await?;
            debug!(node = %node.id, fingerprint = %fingerprint.short(), "artifact stored");
            if outcome.remote_uploaded {
                self.metrics.inc_upload();
                report.uploaded.insert(node.id.clone());
            }
            report.built.insert(node.id.clone(), fingerprint);
        }

        self.metrics.flush();
        Ok(report)
    }
}

/// Bring the node's artifact into the local tier. Any cache failure
/// degrades the node to a rebuild.
async fn lookup(
    store: &CacheStore,
    metrics: &CacheMetrics,
    id: &NodeId,
    fingerprint: &Fingerprint,
) -> (NodeState, Option<CacheEntry>) {
    match store.materialize(fingerprint).await {
        Ok(Materialized::Hit { entry, tier }) => {
            match tier {
                Tier::Local => metrics.inc_local_hit(),
                Tier::Remote => metrics.inc_remote_hit(),
            }
            (NodeState::Fetched, Some(entry))
        }
        Ok(Materialized::Miss) => {
            metrics.inc_miss();
            (NodeState::BuildRequired(BuildReason::CacheMiss), None)
        }
        Ok(Materialized::FetchFailed(e)) => {
            metrics.inc_degraded();
            obs::emit_node_degraded(id, &e);
            (
                NodeState::BuildRequired(BuildReason::FetchFailed(e.to_string())),
                None,
            )
        }
        Err(e) => {
            metrics.inc_degraded();
            obs::emit_node_degraded(id, &e);
            (
                NodeState::BuildRequired(BuildReason::TransportError(e.to_string())),
                None,
            )
        }
    }
}
