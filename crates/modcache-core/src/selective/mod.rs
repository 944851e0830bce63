//! Selective testing: skip test nodes whose fingerprint already passed.

pub mod state;

use std::collections::BTreeMap;

use modcache_store::Fingerprint;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::controller::default_concurrency;
use crate::graph::{Graph, GraphTraverser, NodeFilter, NodeId, NodeKind, Platform};
use crate::hasher::{ContentHasher, HashError};
use crate::obs;
use crate::schedule::CancelSignal;

pub use state::{SelectiveTestStore, STATE_VERSION};

#[derive(Debug, Error)]
pub enum SelectiveError {
    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("test state persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("test state serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SelectiveResult<T> = std::result::Result<T, SelectiveError>;

/// Test nodes split by whether they have to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub to_run: BTreeMap<NodeId, Fingerprint>,
    pub to_skip: BTreeMap<NodeId, Fingerprint>,
}

#[derive(Debug, Clone)]
pub struct SelectiveTesting {
    hasher: ContentHasher,
    store: SelectiveTestStore,
    max_concurrency: usize,
}

impl SelectiveTesting {
    pub fn new(hasher: ContentHasher, store: SelectiveTestStore) -> Self {
        Self {
            hasher,
            store,
            max_concurrency: default_concurrency(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn store(&self) -> &SelectiveTestStore {
        &self.store
    }

    /// Fingerprints recorded by earlier passing runs.
    pub fn previous(&self) -> SelectiveResult<BTreeMap<NodeId, Fingerprint>> {
        self.store.load()
    }

    /// Split every test node of `graph` into run and skip sets.
    pub async fn partition(
        &self,
        graph: &Graph,
        platform: Option<Platform>,
        previous: &BTreeMap<NodeId, Fingerprint>,
    ) -> SelectiveResult<Partition> {
        self.partition_filtered(graph, platform, previous, &NodeFilter::default())
            .await
    }

    /// Like [`SelectiveTesting::partition`], restricted to the test nodes
    /// `filter` selects.
    #[instrument(skip_all, fields(graph = %graph.snapshot().name))]
    pub async fn partition_filtered(
        &self,
        graph: &Graph,
        platform: Option<Platform>,
        previous: &BTreeMap<NodeId, Fingerprint>,
        filter: &NodeFilter,
    ) -> SelectiveResult<Partition> {
        let traverser = GraphTraverser::new(graph, platform);
        let fingerprints = self
            .hasher
            .fingerprint_all(&traverser, self.max_concurrency, &CancelSignal::never())
            .await?;
        let selected = traverser.filter(filter);

        let mut partition = Partition::default();
        for node in traverser.nodes() {
            if !node.kind.is_test() || !selected.contains(&node.id) {
                continue;
            }
            let Some(current) = fingerprints.get(&node.id).copied() else {
                continue;
            };
            // UI tests depend on device state the fingerprint cannot see.
            let unchanged =
                node.kind != NodeKind::UiTests && previous.get(&node.id) == Some(&current);
            if unchanged {
                partition.to_skip.insert(node.id.clone(), current);
            } else {
                partition.to_run.insert(node.id.clone(), current);
            }
        }

        obs::emit_tests_partitioned(partition.to_run.len(), partition.to_skip.len());
        Ok(partition)
    }

    /// Merge newly passed tests into the stored record.
    pub async fn persist(&self, passed: &BTreeMap<NodeId, Fingerprint>) -> SelectiveResult<()> {
        let store = self.store.clone();
        let passed = passed.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut merged = store.load()?;
            merged.extend(passed);
            store.save(&merged)
        })
        .await
        .map_err(|e| SelectiveError::Persistence(std::io::Error::other(e)))
        .and_then(|inner| inner);

        if let Err(e) = &result {
            obs::emit_tests_persist_failed(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::hasher::FileReader;
    use modcache_store::Digest;
    use std::path::PathBuf;

    fn id(name: &str) -> NodeId {
        NodeId::new("Mods", name)
    }

    fn graph() -> Graph {
        Graph::builder("tests")
            .node(Node::new(id("Core"), NodeKind::Library).with_sources(["core.swift"]))
            .node(Node::new(id("CoreTests"), NodeKind::UnitTests).with_tag("fast"))
            .node(Node::new(id("AppUITests"), NodeKind::UiTests))
            .edge(&id("CoreTests"), &id("Core"))
            .edge(&id("AppUITests"), &id("Core"))
            .build()
            .unwrap()
    }

    fn testing(dir: &std::path::Path, core: &str) -> SelectiveTesting {
        let reader = FileReader::snapshot(BTreeMap::from([(
            PathBuf::from("Mods/core.swift"),
            Digest::compute(core.as_bytes()),
        )]));
        SelectiveTesting::new(
            ContentHasher::new(reader, vec![]),
            SelectiveTestStore::for_project(dir, "/work/project"),
        )
        .with_max_concurrency(2)
    }

    #[tokio::test]
    async fn nothing_recorded_runs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let testing = testing(dir.path(), "v1");
        let partition = testing
            .partition(&graph(), None, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(partition.to_run.len(), 2);
        assert!(partition.to_skip.is_empty());
        assert!(!partition.to_run.contains_key(&id("Core")));
    }

    #[tokio::test]
    async fn ui_tests_always_run() {
        let dir = tempfile::tempdir().unwrap();
        let testing = testing(dir.path(), "v1");
        let first = testing
            .partition(&graph(), None, &BTreeMap::new())
            .await
            .unwrap();
        testing.persist(&first.to_run).await.unwrap();

        let previous = testing.previous().unwrap();
        let second = testing.partition(&graph(), None, &previous).await.unwrap();
        assert_eq!(second.to_skip.keys().collect::<Vec<_>>(), vec![&id("CoreTests")]);
        assert_eq!(second.to_run.keys().collect::<Vec<_>>(), vec![&id("AppUITests")]);
    }

    #[tokio::test]
    async fn filter_limits_the_partition() {
        let dir = tempfile::tempdir().unwrap();
        let testing = testing(dir.path(), "v1");
        let filter = NodeFilter {
            include_tags: ["fast".to_string()].into(),
            ..NodeFilter::default()
        };
        let partition = testing
            .partition_filtered(&graph(), None, &BTreeMap::new(), &filter)
            .await
            .unwrap();
        assert_eq!(partition.to_run.keys().collect::<Vec<_>>(), vec![&id("CoreTests")]);
    }

    #[tokio::test]
    async fn persist_merges_with_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let testing = testing(dir.path(), "v1");
        let a = Fingerprint::from_digest(Digest::compute(b"a"));
        let b = Fingerprint::from_digest(Digest::compute(b"b"));

        testing
            .persist(&BTreeMap::from([(id("ATests"), a)]))
            .await
            .unwrap();
        testing
            .persist(&BTreeMap::from([(id("BTests"), b)]))
            .await
            .unwrap();

        let previous = testing.previous().unwrap();
        assert_eq!(previous.get(&id("ATests")), Some(&a));
        assert_eq!(previous.get(&id("BTests")), Some(&b));
    }

    #[tokio::test]
    async fn persist_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // The record's directory cannot be created because a file is in the way.
        std::fs::write(dir.path().join("selective-tests"), b"not a directory").unwrap();
        let testing = testing(dir.path(), "v1");
        let passed = BTreeMap::from([(
            id("CoreTests"),
            Fingerprint::from_digest(Digest::compute(b"x")),
        )]);
        let err = testing.persist(&passed).await.unwrap_err();
        assert!(matches!(err, SelectiveError::Persistence(_)));
    }
}
