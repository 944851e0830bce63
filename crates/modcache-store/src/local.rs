use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::artifact::{Artifact, CacheEntry};
use crate::digest::Fingerprint;
use crate::error::{CacheError, Result};

/// Filesystem cache tier with git-style 2-char sharding.
///
/// Layout: `<root>/<first 2 hex chars>/<remaining hex chars>` holds the
/// artifact bytes and `<remaining hex chars>.json` its [`CacheEntry`].
/// Both are written through a temp file in the shard directory and renamed
/// into place; the artifact rename is the commit point, so a reader never
/// sees a partial artifact and an aborted write leaves only a temp file.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    /// Create a `LocalCache` rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path the artifact for `fingerprint` lives at once committed.
    pub fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(&hex[..2]).join(format!("{}.json", &hex[2..]))
    }

    pub fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.artifact_path(fingerprint).is_file())
    }

    /// Read the recorded metadata. A missing or unreadable record is `None`.
    pub fn entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let raw = match fs::read(self.entry_path(fingerprint)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "unreadable cache entry metadata"
                );
                Ok(None)
            }
        }
    }

    /// Read and verify the artifact. Anything that fails verification is a
    /// miss. A hit refreshes the artifact's modification time so that
    /// [`LocalCache::clean`] evicts least recently used entries first.
    pub fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        Ok(self
            .fetch_with_entry(fingerprint)?
            .map(|(artifact, _)| artifact))
    }

    /// [`LocalCache::fetch`], also returning the entry the bytes were
    /// verified against.
    pub fn fetch_with_entry(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(Artifact, CacheEntry)>> {
        let Some((artifact, entry)) = self.verified(fingerprint)? else {
            return Ok(None);
        };
        let path = self.artifact_path(fingerprint);
        if let Err(e) = touch(&path) {
            debug!(path = %path.display(), error = %e, "could not refresh modification time");
        }
        Ok(Some((artifact, entry)))
    }

    fn verified(&self, fingerprint: &Fingerprint) -> Result<Option<(Artifact, CacheEntry)>> {
        let bytes = match fs::read(self.artifact_path(fingerprint)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        let artifact = Artifact::new(bytes);

        let Some(entry) = self.entry(fingerprint)? else {
            warn!(fingerprint = %fingerprint.short(), "artifact without metadata, ignoring");
            return Ok(None);
        };
        if let Err(e) = entry.verify(&artifact) {
            warn!(
                fingerprint = %fingerprint.short(),
                error = %e,
                "local artifact failed verification"
            );
            return Ok(None);
        }
        Ok(Some((artifact, entry)))
    }

    /// Store `artifact` under `fingerprint`. Storing over an intact committed
    /// entry is a no-op that returns it; a corrupt or half-present entry is
    /// overwritten.
    pub fn store(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<CacheEntry> {
        let path = self.artifact_path(fingerprint);
        if path.is_file() {
            if let Some((_, existing)) = self.verified(fingerprint)? {
                return Ok(existing);
            }
            debug!(fingerprint = %fingerprint.short(), "replacing damaged local entry");
        }

        let shard_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&shard_dir)?;

        let entry = CacheEntry::new(*fingerprint, artifact, path.display().to_string());
        write_atomic(&shard_dir, &self.entry_path(fingerprint), &serde_json::to_vec(&entry)?)?;
        write_atomic(&shard_dir, &path, artifact.bytes())?;

        debug!(fingerprint = %fingerprint.short(), size = entry.size, "stored artifact locally");
        Ok(entry)
    }

    /// All committed fingerprints with their last-use time.
    pub fn entries(&self) -> Result<Vec<(Fingerprint, SystemTime)>> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().to_string();
            if prefix.len() != 2 {
                continue;
            }
            for file in fs::read_dir(shard.path())? {
                let file = file?;
                let name = file.file_name().to_string_lossy().to_string();
                if name.contains('.') {
                    // metadata sidecars and orphaned temp files
                    continue;
                }
                let Ok(fingerprint) = format!("{prefix}{name}").parse::<Fingerprint>() else {
                    continue;
                };
                let modified = file.metadata()?.modified()?;
                out.push((fingerprint, modified));
            }
        }
        Ok(out)
    }

    /// Evict entries unused for longer than `max_age`, then trim to the
    /// `max_entries` most recently used. Returns the evicted fingerprints.
    pub fn clean(
        &self,
        max_age: Option<Duration>,
        max_entries: Option<usize>,
    ) -> Result<Vec<Fingerprint>> {
        let now = SystemTime::now();
        let mut entries = self.entries()?;
        // newest first
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut evicted = Vec::new();
        let mut kept = 0usize;
        for (fingerprint, modified) in entries {
            let too_old = max_age.is_some_and(|age| {
                now.duration_since(modified)
                    .map(|elapsed| elapsed > age)
                    .unwrap_or(false)
            });
            let over_limit = max_entries.is_some_and(|limit| kept >= limit);
            if too_old || over_limit {
                self.remove(&fingerprint)?;
                evicted.push(fingerprint);
            } else {
                kept += 1;
            }
        }

        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), kept, "cleaned local cache");
        }
        Ok(evicted)
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<()> {
        for path in [self.artifact_path(fingerprint), self.entry_path(fingerprint)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
        Ok(())
    }
}

fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn touch(path: &Path) -> std::io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}
