//! End-to-end cache resolution and warming against a two-tier store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use modcache_core::{
    Artifact, ArtifactBuilder, BuildReason, CacheController, CacheMetrics, CacheStore,
    CancelHandle, CancelSignal, ContentHasher, ControllerConfig, ControllerError, Digest,
    FileReader, Fingerprint, Graph, GraphTraverser, LocalCache, MemoryRemoteCache, Node, NodeId,
    NodeKind, NodeState, RemoteTier,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn id(name: &str) -> NodeId {
    NodeId::new("Modules", name)
}

fn reader() -> FileReader {
    FileReader::snapshot(
        ["core.swift", "net.swift", "app.swift"]
            .iter()
            .map(|file| {
                (
                    PathBuf::from(format!("Modules/{file}")),
                    Digest::compute(file.as_bytes()),
                )
            })
            .collect(),
    )
}

/// App → {Core, Net}, Net → Core.
fn graph() -> Graph {
    Graph::builder("app")
        .node(Node::new(id("Core"), NodeKind::Framework).with_sources(["core.swift"]))
        .node(Node::new(id("Net"), NodeKind::Library).with_sources(["net.swift"]))
        .node(Node::new(id("App"), NodeKind::Application).with_sources(["app.swift"]))
        .edge(&id("App"), &id("Core"))
        .edge(&id("App"), &id("Net"))
        .edge(&id("Net"), &id("Core"))
        .build()
        .expect("graph")
}

struct Fixture {
    dir: tempfile::TempDir,
    remote: Arc<MemoryRemoteCache>,
    controller: CacheController,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(MemoryRemoteCache::new());
    let store = CacheStore::new(
        LocalCache::new(dir.path()).expect("local"),
        Some(RemoteTier::Memory(Arc::clone(&remote))),
    );
    let controller = CacheController::new(
        ContentHasher::new(reader(), vec![]),
        Arc::new(store),
        ControllerConfig {
            max_concurrency: 3,
            ..ControllerConfig::default()
        },
        Arc::new(CacheMetrics::new()),
    );
    Fixture {
        dir,
        remote,
        controller,
    }
}

/// Put a directory where the local metadata file of `fingerprint` goes, so
/// the local tier cannot commit it.
fn block_local_entry(fx: &Fixture, fingerprint: &Fingerprint) {
    let hex = fingerprint.to_hex();
    std::fs::create_dir_all(
        fx.dir
            .path()
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..])),
    )
    .expect("block metadata path");
}

async fn fingerprint(controller: &CacheController, graph: &Graph, name: &str) -> Fingerprint {
    let traverser = GraphTraverser::new(graph, None);
    controller
        .hasher()
        .fingerprint(&traverser, &id(name))
        .await
        .expect("fingerprint")
}

/// Returns `name.bin` for every node except those listed as failing.
struct ScriptedBuilder {
    failing: Vec<&'static str>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ArtifactBuilder for ScriptedBuilder {
    async fn build(&self, node: &Node, _fingerprint: &Fingerprint) -> anyhow::Result<Artifact> {
        self.calls.lock().unwrap().push(node.id.name.clone());
        if self.failing.contains(&node.id.name.as_str()) {
            anyhow::bail!("compiler exited with status 1");
        }
        Ok(Artifact::new(format!("{}.bin", node.id.name).into_bytes()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_hit_is_written_through_and_reused_without_network() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    fx.remote
        .insert(core_fp, &Artifact::new(b"Core.framework".to_vec()));

    let first = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");
    assert_eq!(first.state(&id("Core")), Some(&NodeState::Fetched));
    assert_eq!(first.fingerprints[&id("Core")], core_fp);
    assert!(fx
        .controller
        .store()
        .local()
        .exists(&core_fp)
        .expect("exists"));
    assert_eq!(fx.controller.metrics().snapshot().remote_hits, 1);
    // Lookup and download for Core, lookup for the Net miss.
    assert_eq!(fx.remote.requests(), 3);

    let requests = fx.remote.requests();
    let second = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");
    assert_eq!(second.state(&id("Core")), Some(&NodeState::Fetched));
    assert_eq!(fx.controller.metrics().snapshot().local_hits, 1);

    // Only Net (a miss) went to the remote again.
    assert_eq!(fx.remote.requests() - requests, 1);
}

#[tokio::test]
async fn second_resolve_of_cached_graph_makes_no_remote_calls() {
    let fx = fixture();
    let graph = graph();
    for name in ["Core", "Net"] {
        let fp = fingerprint(&fx.controller, &graph, name).await;
        fx.remote.insert(fp, &Artifact::new(name.as_bytes().to_vec()));
    }

    fx.controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");
    let requests = fx.remote.requests();

    let again = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");
    assert_eq!(fx.remote.requests(), requests);
    assert_eq!(again.prebuilt.len(), 2);
    assert_eq!(
        again.build_required.iter().collect::<Vec<_>>(),
        vec![&id("App")]
    );
}

#[tokio::test]
async fn transport_failure_degrades_only_the_affected_node() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    fx.controller
        .store()
        .local()
        .store(&core_fp, &Artifact::new(b"core".to_vec()))
        .expect("seed local");
    fx.remote.set_offline(true);

    let resolution = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("cache errors never abort resolution");

    assert_eq!(resolution.state(&id("Core")), Some(&NodeState::Fetched));
    assert!(matches!(
        resolution.state(&id("Net")),
        Some(NodeState::BuildRequired(BuildReason::TransportError(_)))
    ));
    assert_eq!(
        resolution.state(&id("App")),
        Some(&NodeState::BuildRequired(BuildReason::NotCacheable))
    );
    assert_eq!(fx.controller.metrics().snapshot().degraded, 1);
}

#[tokio::test]
async fn corrupted_remote_artifact_is_rebuilt_and_never_cached_locally() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    fx.remote
        .insert(core_fp, &Artifact::new(b"Core.framework".to_vec()));
    fx.remote.corrupt(&core_fp, b"Core.fram".to_vec());

    let resolution = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");

    assert!(matches!(
        resolution.state(&id("Core")),
        Some(NodeState::BuildRequired(BuildReason::FetchFailed(_)))
    ));
    assert!(!fx
        .controller
        .store()
        .local()
        .exists(&core_fp)
        .expect("exists"));
    assert!(resolution.build_required.contains(&id("Core")));
}

#[tokio::test]
async fn remote_hit_that_cannot_be_kept_locally_is_rebuilt() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    fx.remote
        .insert(core_fp, &Artifact::new(b"Core.framework".to_vec()));
    block_local_entry(&fx, &core_fp);

    let resolution = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");

    assert!(matches!(
        resolution.state(&id("Core")),
        Some(NodeState::BuildRequired(BuildReason::FetchFailed(_)))
    ));
    assert!(!resolution.prebuilt.contains_key(&id("Core")));
    assert!(!resolution
        .resolved_graph
        .node(&id("Core"))
        .expect("core")
        .is_prebuilt());
    assert_eq!(fx.controller.metrics().snapshot().degraded, 1);
}

#[tokio::test]
async fn prebuilt_locations_point_into_the_local_tier() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    fx.remote.insert(core_fp, &Artifact::new(b"core".to_vec()));

    let resolution = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");

    let local_path = fx.controller.store().local().artifact_path(&core_fp);
    assert_eq!(
        resolution.prebuilt[&id("Core")].location,
        local_path.display().to_string()
    );
    assert!(local_path.is_file());
}

#[tokio::test]
async fn fetched_nodes_are_marked_prebuilt_in_the_resolved_graph() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    fx.remote.insert(core_fp, &Artifact::new(b"core".to_vec()));

    let resolution = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");

    let resolved = &resolution.resolved_graph;
    assert!(resolved.node(&id("Core")).expect("core").is_prebuilt());
    assert!(!resolved.node(&id("Net")).expect("net").is_prebuilt());
    assert_eq!(resolved.len(), graph.len());
    assert_eq!(
        resolution.fetched().collect::<Vec<_>>(),
        vec![&id("Core")]
    );
}

#[tokio::test]
async fn cancelled_resolution_returns_cancelled() {
    let fx = fixture();
    let handle = CancelHandle::new();
    handle.cancel();

    let err = fx
        .controller
        .resolve(&graph(), None, &handle.signal())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Cancelled));
}

#[tokio::test]
async fn warm_builds_and_uploads_missing_artifacts() {
    let fx = fixture();
    let graph = graph();
    let builder = ScriptedBuilder {
        failing: vec![],
        calls: Mutex::new(Vec::new()),
    };

    let report = fx
        .controller
        .warm(&graph, None, &builder, &CancelSignal::never())
        .await
        .expect("warm");

    // Dependencies are built before dependents.
    assert_eq!(*builder.calls.lock().unwrap(), vec!["Core", "Net"]);
    assert_eq!(report.built.len(), 2);
    assert_eq!(report.uploaded.len(), 2);
    assert!(report.skipped.contains(&id("App")));
    assert!(report.failed.is_empty());
    assert_eq!(fx.controller.metrics().snapshot().uploads, 2);

    let resolution = fx
        .controller
        .resolve(&graph, None, &CancelSignal::never())
        .await
        .expect("resolve");
    assert_eq!(resolution.prebuilt.len(), 2);
}

#[tokio::test]
async fn warm_keeps_going_after_a_failed_build() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    fx.remote.insert(core_fp, &Artifact::new(b"core".to_vec()));
    let builder = ScriptedBuilder {
        failing: vec!["Net"],
        calls: Mutex::new(Vec::new()),
    };

    let report = fx
        .controller
        .warm(&graph, None, &builder, &CancelSignal::never())
        .await
        .expect("warm");

    assert!(report.cached.contains(&id("Core")));
    assert!(report.built.is_empty());
    assert!(report.failed[&id("Net")].contains("status 1"));
    assert_eq!(*builder.calls.lock().unwrap(), vec!["Net"]);
}

#[tokio::test]
async fn warm_stops_when_the_local_tier_rejects_artifacts() {
    let fx = fixture();
    let graph = graph();
    let core_fp = fingerprint(&fx.controller, &graph, "Core").await;
    block_local_entry(&fx, &core_fp);
    let builder = ScriptedBuilder {
        failing: vec![],
        calls: Mutex::new(Vec::new()),
    };

    let err = fx
        .controller
        .warm(&graph, None, &builder, &CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, ControllerError::Store(_)));
    assert_eq!(*builder.calls.lock().unwrap(), vec!["Core"]);
}

#[tokio::test]
async fn salt_separates_cache_namespaces() {
    let fx = fixture();
    let graph = graph();
    let plain = fingerprint(&fx.controller, &graph, "Core").await;

    let salted = ContentHasher::new(reader(), vec!["xcode-16.1".to_string()]);
    let traverser = GraphTraverser::new(&graph, None);
    let salted_fp = salted
        .fingerprint(&traverser, &id("Core"))
        .await
        .expect("fingerprint");
    assert_ne!(plain, salted_fp);

    let all: BTreeMap<_, _> = salted
        .fingerprint_all(&traverser, 2, &CancelSignal::never())
        .await
        .expect("fingerprint all");
    assert_eq!(all[&id("Core")], salted_fp);
}
