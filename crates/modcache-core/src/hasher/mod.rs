//! Content fingerprints for graph nodes.
//!
//! A node's fingerprint covers its identity, the digests of its source and
//! resource files, its canonical settings, the fingerprints of its active
//! direct dependencies and the configured salt. Each of these slots is
//! hashed on its own with a tag, then the slot digests are hashed together
//! in a fixed order. Every variable-length item is length-prefixed.

pub mod canonical;
pub mod error;
pub mod reader;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::try_join_all;
use modcache_store::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use tracing::{debug, instrument};

use crate::graph::{GraphError, GraphSnapshot, GraphTraverser, Node, NodeId, Platform};
use crate::schedule::{run_ready_queue, CancelSignal, ReadyNode};

pub use canonical::{canonical_json, canonical_settings, CanonicalError};
pub use error::{HashError, HashResult};
pub use reader::FileReader;

/// Length-prefixed SHA-256 writer for one slot.
struct SlotHasher(Sha256);

impl SlotHasher {
    fn new(tag: &str) -> Self {
        let mut slot = Self(Sha256::new());
        slot.field(tag.as_bytes());
        slot
    }

    fn field(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u64).to_be_bytes());
        self.0.update(bytes);
    }

    fn count(&mut self, n: usize) {
        self.0.update((n as u64).to_be_bytes());
    }

    fn finish(self) -> Digest {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0.finalize());
        Digest::from_bytes(bytes)
    }
}

/// Per-slot digests of one node, for explaining why a fingerprint changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintBreakdown {
    pub node: NodeId,
    pub identity: Digest,
    pub sources: Digest,
    pub resources: Digest,
    pub settings: Digest,
    pub dependencies: Digest,
    pub salt: Digest,
    pub fingerprint: Fingerprint,
}

impl FingerprintBreakdown {
    fn slots(&self) -> [(&'static str, Digest); 6] {
        [
            ("identity", self.identity),
            ("sources", self.sources),
            ("resources", self.resources),
            ("settings", self.settings),
            ("dependencies", self.dependencies),
            ("salt", self.salt),
        ]
    }

    /// Names of the slots that differ from `other`.
    pub fn changed_slots(&self, other: &FingerprintBreakdown) -> Vec<&'static str> {
        self.slots()
            .into_iter()
            .zip(other.slots())
            .filter(|((_, ours), (_, theirs))| ours != theirs)
            .map(|((name, _), _)| name)
            .collect()
    }
}

pub(crate) type MemoKey = (GraphSnapshot, Option<Platform>, NodeId);

#[derive(Debug)]
struct HasherInner {
    reader: FileReader,
    salt: Vec<String>,
    memo: Mutex<HashMap<MemoKey, Fingerprint>>,
}

/// Computes node fingerprints. Cheap to clone; clones share the memo table.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    inner: Arc<HasherInner>,
}

impl ContentHasher {
    pub fn new(reader: FileReader, salt: Vec<String>) -> Self {
        Self {
            inner: Arc::new(HasherInner {
                reader,
                salt,
                memo: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn salt(&self) -> &[String] {
        &self.inner.salt
    }

    /// Number of memoised fingerprints.
    pub fn memoized(&self) -> usize {
        self.memo().len()
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<MemoKey, Fingerprint>> {
        self.inner.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn memo_key(traverser: &GraphTraverser<'_>, id: &NodeId) -> MemoKey {
        (
            traverser.graph().snapshot().clone(),
            traverser.platform().cloned(),
            id.clone(),
        )
    }

    /// Memo lookup for `key`, hashing `node` on a miss.
    pub(crate) async fn memoised_fingerprint(
        &self,
        key: MemoKey,
        node: &Node,
        dependencies: &[Fingerprint],
    ) -> HashResult<Fingerprint> {
        let memoised = self.memo().get(&key).copied();
        if let Some(fingerprint) = memoised {
            return Ok(fingerprint);
        }
        let fingerprint = self.hash_node(node, dependencies).await?.fingerprint;
        self.memo().insert(key, fingerprint);
        Ok(fingerprint)
    }

    /// Hash one node given the fingerprints of its direct dependencies.
    pub async fn hash_node(
        &self,
        node: &Node,
        dependencies: &[Fingerprint],
    ) -> HashResult<FingerprintBreakdown> {
        let mut identity = SlotHasher::new("identity");
        identity.field(node.id.container.as_bytes());
        identity.field(node.id.name.as_bytes());
        identity.field(node.kind.as_str().as_bytes());
        let identity = identity.finish();

        let sources = self.file_slot("sources", node, &node.sources).await?;
        let resources = self.file_slot("resources", node, &node.resources).await?;

        let canonical =
            canonical_settings(&node.settings).map_err(|e| HashError::InvalidSettings {
                node: node.id.clone(),
                reason: e.to_string(),
            })?;
        let mut settings = SlotHasher::new("settings");
        settings.field(canonical.as_bytes());
        let settings = settings.finish();

        let mut sorted = dependencies.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut deps = SlotHasher::new("dependencies");
        deps.count(sorted.len());
        for fingerprint in &sorted {
            deps.field(fingerprint.as_bytes());
        }
        let dependencies = deps.finish();

        let mut salt = SlotHasher::new("salt");
        salt.count(self.inner.salt.len());
        for item in &self.inner.salt {
            salt.field(item.as_bytes());
        }
        let salt = salt.finish();

        let mut combined = SlotHasher::new("fingerprint");
        for slot in [identity, sources, resources, settings, dependencies, salt] {
            combined.field(slot.as_bytes());
        }
        let fingerprint = Fingerprint::from_digest(combined.finish());

        Ok(FingerprintBreakdown {
            node: node.id.clone(),
            identity,
            sources,
            resources,
            settings,
            dependencies,
            salt,
            fingerprint,
        })
    }

    async fn file_slot(&self, tag: &str, node: &Node, paths: &[PathBuf]) -> HashResult<Digest> {
        let mut entries: Vec<(String, &Path)> = paths
            .iter()
            .map(|path| (path.to_string_lossy().replace('\\', "/"), path.as_path()))
            .collect();
        entries.sort();
        entries.dedup_by(|a, b| a.0 == b.0);

        let digests = try_join_all(
            entries
                .iter()
                .map(|(_, path)| self.inner.reader.digest(&node.id, path)),
        )
        .await?;

        let mut slot = SlotHasher::new(tag);
        slot.count(entries.len());
        for ((path, _), digest) in entries.iter().zip(digests) {
            slot.field(path.as_bytes());
            slot.field(digest.as_bytes());
        }
        Ok(slot.finish())
    }

    /// Fingerprint of `id`, hashing its dependency closure first.
    pub async fn fingerprint(
        &self,
        traverser: &GraphTraverser<'_>,
        id: &NodeId,
    ) -> HashResult<Fingerprint> {
        let memoised = self.memo().get(&Self::memo_key(traverser, id)).copied();
        if let Some(fingerprint) = memoised {
            return Ok(fingerprint);
        }

        let target = traverser.index_of(id)?;
        let closure: HashSet<&NodeId> = traverser
            .closure_indices(target)
            .into_iter()
            .map(|idx| &traverser.node_at(idx).id)
            .collect();
        let order = traverser.topological_order()?;

        let mut computed: HashMap<NodeId, Fingerprint> = HashMap::new();
        for node in order.iter().filter(|node| closure.contains(&node.id)) {
            let deps: Vec<Fingerprint> = traverser
                .direct_dependencies(&node.id)?
                .iter()
                .filter_map(|dep| computed.get(&dep.id).copied())
                .collect();
            let key = Self::memo_key(traverser, &node.id);
            let fingerprint = self.memoised_fingerprint(key, node, &deps).await?;
            computed.insert(node.id.clone(), fingerprint);
        }

        computed
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(id.clone()).into())
    }

    /// Slot-by-slot digests of `id`.
    pub async fn breakdown(
        &self,
        traverser: &GraphTraverser<'_>,
        id: &NodeId,
    ) -> HashResult<FingerprintBreakdown> {
        traverser.topological_order()?;
        let node = traverser.node(id)?;
        let mut deps = Vec::new();
        for dep in traverser.direct_dependencies(id)? {
            deps.push(self.fingerprint(traverser, &dep.id).await?);
        }
        self.hash_node(node, &deps).await
    }

    /// Fingerprint every node, up to `max_concurrency` at a time.
    #[instrument(
        skip_all,
        fields(graph = %traverser.graph().snapshot().name, nodes = traverser.graph().len())
    )]
    pub async fn fingerprint_all(
        &self,
        traverser: &GraphTraverser<'_>,
        max_concurrency: usize,
        cancel: &CancelSignal,
    ) -> HashResult<BTreeMap<NodeId, Fingerprint>> {
        traverser.topological_order()?;

        let fingerprints = run_ready_queue(
            traverser,
            max_concurrency,
            cancel,
            |ready: ReadyNode<Fingerprint>| {
                let hasher = self.clone();
                let key = Self::memo_key(traverser, &ready.node.id);
                async move {
                    let deps: Vec<Fingerprint> =
                        ready.dependencies.iter().map(|(_, fp)| *fp).collect();
                    hasher.memoised_fingerprint(key, &ready.node, &deps).await
                }
            },
        )
        .await?;

        debug!(count = fingerprints.len(), "graph fingerprinted");
        Ok(fingerprints)
    }
}
