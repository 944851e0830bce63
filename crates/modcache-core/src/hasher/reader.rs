//! Sources of file content digests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use modcache_store::Digest;

use crate::graph::NodeId;
use crate::hasher::error::{HashError, HashResult};

/// Where the hasher gets the digest of an input file.
///
/// Paths are always `<container>/<relative path>` of the owning node.
#[derive(Debug, Clone)]
pub enum FileReader {
    /// Read and hash files below `root`.
    Disk { root: PathBuf },
    /// Precomputed digests captured once per invocation.
    Snapshot(Arc<BTreeMap<PathBuf, Digest>>),
}

impl FileReader {
    pub fn disk(root: impl Into<PathBuf>) -> Self {
        FileReader::Disk { root: root.into() }
    }

    pub fn snapshot(digests: BTreeMap<PathBuf, Digest>) -> Self {
        FileReader::Snapshot(Arc::new(digests))
    }

    /// Digest of `relative`, a file of `node`.
    pub async fn digest(&self, node: &NodeId, relative: &Path) -> HashResult<Digest> {
        let path = Path::new(&node.container).join(relative);
        match self {
            FileReader::Disk { root } => match tokio::fs::read(root.join(&path)).await {
                Ok(bytes) => Ok(Digest::compute(&bytes)),
                Err(e) => {
                    tracing::debug!(
                        node = %node,
                        path = %path.display(),
                        error = %e,
                        "input file unreadable"
                    );
                    Err(HashError::MissingFile {
                        node: node.clone(),
                        path,
                    })
                }
            },
            FileReader::Snapshot(digests) => {
                digests
                    .get(&path)
                    .copied()
                    .ok_or_else(|| HashError::MissingFile {
                        node: node.clone(),
                        path,
                    })
            }
        }
    }
}
