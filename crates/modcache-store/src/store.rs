//! Composed two-tier cache: local disk first, remote second.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::artifact::{Artifact, CacheEntry};
use crate::digest::Fingerprint;
use crate::error::{CacheError, Result};
use crate::fakes::MemoryRemoteCache;
use crate::local::LocalCache;
use crate::remote::HttpRemoteCache;

/// Remote backends, chosen when the store is constructed.
#[derive(Debug, Clone)]
pub enum RemoteTier {
    Http(HttpRemoteCache),
    Memory(Arc<MemoryRemoteCache>),
}

impl RemoteTier {
    pub async fn head(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        match self {
            RemoteTier::Http(remote) => remote.head(fingerprint).await,
            RemoteTier::Memory(remote) => remote.head(fingerprint).await,
        }
    }

    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        match self {
            RemoteTier::Http(remote) => remote.exists(fingerprint).await,
            RemoteTier::Memory(remote) => remote.exists(fingerprint).await,
        }
    }

    pub async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        match self {
            RemoteTier::Http(remote) => remote.fetch(fingerprint).await,
            RemoteTier::Memory(remote) => remote.fetch(fingerprint).await,
        }
    }

    pub async fn download(
        &self,
        fingerprint: &Fingerprint,
        entry: &CacheEntry,
    ) -> Result<Option<Artifact>> {
        match self {
            RemoteTier::Http(remote) => remote.download(fingerprint, entry).await,
            RemoteTier::Memory(remote) => remote.download(fingerprint, entry).await,
        }
    }

    pub async fn store(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<()> {
        match self {
            RemoteTier::Http(remote) => remote.store(fingerprint, artifact).await,
            RemoteTier::Memory(remote) => remote.store(fingerprint, artifact).await,
        }
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

/// Result of [`CacheStore::materialize`].
#[derive(Debug)]
pub enum Materialized {
    /// A verified copy is committed locally; `entry.location` is its path.
    Hit { entry: CacheEntry, tier: Tier },
    Miss,
    /// The remote reported the artifact but no verified copy could be
    /// committed locally.
    FetchFailed(CacheError),
}

/// Result of [`CacheStore::store`].
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub entry: CacheEntry,
    /// False when there is no remote or the upload failed.
    pub remote_uploaded: bool,
}

/// Fingerprint → artifact store over a local tier and an optional remote.
#[derive(Debug)]
pub struct CacheStore {
    local: LocalCache,
    remote: Option<RemoteTier>,
}

impl CacheStore {
    pub fn new(local: LocalCache, remote: Option<RemoteTier>) -> Self {
        Self { local, remote }
    }

    pub fn local_only(local: LocalCache) -> Self {
        Self::new(local, None)
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn remote(&self) -> Option<&RemoteTier> {
        self.remote.as_ref()
    }

    async fn on_local<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(LocalCache) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let local = self.local.clone();
        tokio::task::spawn_blocking(move || op(local))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    /// Tier holding `fingerprint`, local checked first.
    pub async fn locate(&self, fingerprint: &Fingerprint) -> Result<Option<Tier>> {
        let fp = *fingerprint;
        if self.on_local(move |local| local.exists(&fp)).await? {
            return Ok(Some(Tier::Local));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        if remote.exists(fingerprint).await? {
            Ok(Some(Tier::Remote))
        } else {
            Ok(None)
        }
    }

    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.locate(fingerprint).await?.is_some())
    }

    pub async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        Ok(self
            .fetch_with_tier(fingerprint)
            .await?
            .map(|(artifact, _)| artifact))
    }

    /// Fetch, reporting the tier that served it. A remote hit is written
    /// through to the local tier before it is returned; a remote artifact
    /// that fails verification is a miss and never reaches the local tier.
    pub async fn fetch_with_tier(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(Artifact, Tier)>> {
        let fp = *fingerprint;
        if let Some(artifact) = self.on_local(move |local| local.fetch(&fp)).await? {
            return Ok(Some((artifact, Tier::Local)));
        }

        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let artifact = match remote.fetch(fingerprint).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => return Ok(None),
            Err(e @ CacheError::Verification { .. }) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "remote artifact rejected");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let written = artifact.clone();
        match self
            .on_local(move |local| local.store(&fp, &written))
            .await
        {
            Ok(_) => {
                debug!(fingerprint = %fingerprint.short(), "wrote remote hit through to local tier")
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "local write-through failed")
            }
        }
        Ok(Some((artifact, Tier::Remote)))
    }

    /// Bring the artifact into the local tier. The existence check is a
    /// single remote HEAD whose metadata also verifies the download. Errors
    /// from the existence check are returned; anything that goes wrong
    /// after a reported hit is [`Materialized::FetchFailed`].
    pub async fn materialize(&self, fingerprint: &Fingerprint) -> Result<Materialized> {
        let fp = *fingerprint;
        if let Some((_, entry)) = self
            .on_local(move |local| local.fetch_with_entry(&fp))
            .await?
        {
            return Ok(Materialized::Hit {
                entry,
                tier: Tier::Local,
            });
        }

        let Some(remote) = &self.remote else {
            return Ok(Materialized::Miss);
        };
        let Some(remote_entry) = remote.head(fingerprint).await? else {
            return Ok(Materialized::Miss);
        };
        let artifact = match remote.download(fingerprint, &remote_entry).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                return Ok(Materialized::FetchFailed(CacheError::Transport(format!(
                    "{} disappeared between lookup and download",
                    fingerprint.short()
                ))))
            }
            Err(e) => return Ok(Materialized::FetchFailed(e)),
        };
        match self.on_local(move |local| local.store(&fp, &artifact)).await {
            Ok(entry) => {
                debug!(fingerprint = %fingerprint.short(), "materialized remote hit locally");
                Ok(Materialized::Hit {
                    entry,
                    tier: Tier::Remote,
                })
            }
            Err(e) => Ok(Materialized::FetchFailed(e)),
        }
    }

    /// Store locally (required) and upload remotely (best effort).
    pub async fn store(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Artifact,
    ) -> Result<StoreOutcome> {
        let fp = *fingerprint;
        let owned = artifact.clone();
        let entry = self.on_local(move |local| local.store(&fp, &owned)).await?;

        let remote_uploaded = match &self.remote {
            None => false,
            Some(remote) => match remote.store(fingerprint, artifact).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(fingerprint = %fingerprint.short(), error = %e, "remote upload failed");
                    false
                }
            },
        };

        Ok(StoreOutcome {
            entry,
            remote_uploaded,
        })
    }

    /// Metadata from whichever tier knows the fingerprint.
    pub async fn entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let fp = *fingerprint;
        if let Some(entry) = self.on_local(move |local| local.entry(&fp)).await? {
            return Ok(Some(entry));
        }
        match &self.remote {
            Some(remote) => remote.head(fingerprint).await,
            None => Ok(None),
        }
    }
}
