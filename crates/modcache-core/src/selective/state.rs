//! On-disk record of the last passing fingerprint of each test node.
//!
//! One JSON file per project, named after the SHA-256 of the project root:
//! `{"version": 1, "passed": {"<container:name>": "<fingerprint hex>"}}`.
//! Saves go through a synced temp file renamed over the old record, so an
//! interrupted save leaves the previous record intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use modcache_store::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::graph::NodeId;
use crate::selective::{SelectiveError, SelectiveResult};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
    passed: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SelectiveTestStore {
    path: PathBuf,
}

impl SelectiveTestStore {
    /// Store for `project_root`, kept below `state_dir`.
    pub fn for_project(state_dir: impl AsRef<Path>, project_root: impl AsRef<Path>) -> Self {
        let key = Digest::compute(project_root.as_ref().to_string_lossy().as_bytes());
        Self {
            path: state_dir
                .as_ref()
                .join("selective-tests")
                .join(format!("{}.json", key.to_hex())),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previously passed fingerprints. A missing record is empty; a record
    /// that cannot be trusted is discarded with a warning.
    pub fn load(&self) -> SelectiveResult<BTreeMap<NodeId, Fingerprint>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(SelectiveError::Persistence(e)),
        };
        let file: StateFile = match serde_json::from_slice(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable test state");
                return Ok(BTreeMap::new());
            }
        };
        if file.version != STATE_VERSION {
            warn!(
                path = %self.path.display(),
                version = file.version,
                "discarding test state with unknown version"
            );
            return Ok(BTreeMap::new());
        }

        let mut passed = BTreeMap::new();
        for (id, fingerprint) in file.passed {
            match (id.parse::<NodeId>(), fingerprint.parse::<Fingerprint>()) {
                (Ok(id), Ok(fingerprint)) => {
                    passed.insert(id, fingerprint);
                }
                _ => debug!(node = %id, "skipping malformed test state entry"),
            }
        }
        Ok(passed)
    }

    /// Replace the record with `passed`.
    pub fn save(&self, passed: &BTreeMap<NodeId, Fingerprint>) -> SelectiveResult<()> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)?;

        let file = StateFile {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            passed: passed
                .iter()
                .map(|(id, fingerprint)| (id.to_string(), fingerprint.to_hex()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), entries = passed.len(), "test state saved");
        Ok(())
    }
}
