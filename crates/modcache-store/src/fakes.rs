//! In-process remote tier.
//!
//! Behaves like the HTTP remote (metadata lookup, verified download,
//! idempotent upload) without a network. Counts every request so callers
//! can assert that a lookup was served locally, and can be switched
//! offline or made to serve corrupted bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::artifact::{Artifact, CacheEntry};
use crate::digest::Fingerprint;
use crate::error::{CacheError, Result};

#[derive(Debug, Default)]
pub struct MemoryRemoteCache {
    objects: Mutex<HashMap<Fingerprint, (CacheEntry, Vec<u8>)>>,
    requests: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<Fingerprint, (CacheEntry, Vec<u8>)>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Transport("remote cache unreachable".to_string()));
        }
        Ok(())
    }

    /// Number of requests served (or refused) so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Make every subsequent request fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Seed an entry without counting a request.
    pub fn insert(&self, fingerprint: Fingerprint, artifact: &Artifact) {
        let entry = CacheEntry::new(fingerprint, artifact, format!("memory://{fingerprint}"));
        self.objects()
            .insert(fingerprint, (entry, artifact.bytes().to_vec()));
    }

    /// Replace the stored bytes but keep the advertised metadata, as a
    /// truncated or corrupted transfer would.
    pub fn corrupt(&self, fingerprint: &Fingerprint, bytes: impl Into<Vec<u8>>) {
        if let Some(object) = self.objects().get_mut(fingerprint) {
            object.1 = bytes.into();
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.objects().contains_key(fingerprint)
    }

    pub async fn head(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        self.request()?;
        Ok(self.objects().get(fingerprint).map(|(entry, _)| entry.clone()))
    }

    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.head(fingerprint).await?.is_some())
    }

    pub async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        self.request()?;
        let Some((entry, bytes)) = self.objects().get(fingerprint).cloned() else {
            return Ok(None);
        };
        let artifact = Artifact::new(bytes);
        entry.verify(&artifact)?;
        Ok(Some(artifact))
    }

    /// Serve the stored bytes, verified against `entry` rather than the
    /// metadata held here.
    pub async fn download(
        &self,
        fingerprint: &Fingerprint,
        entry: &CacheEntry,
    ) -> Result<Option<Artifact>> {
        self.request()?;
        let Some((_, bytes)) = self.objects().get(fingerprint).cloned() else {
            return Ok(None);
        };
        let artifact = Artifact::new(bytes);
        entry.verify(&artifact)?;
        Ok(Some(artifact))
    }

    pub async fn store(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<()> {
        self.request()?;
        let mut objects = self.objects();
        if let Some((existing, _)) = objects.get(fingerprint) {
            if existing.content_digest == artifact.content_digest() {
                return Ok(());
            }
        }
        let entry = CacheEntry::new(*fingerprint, artifact, format!("memory://{fingerprint}"));
        objects.insert(*fingerprint, (entry, artifact.bytes().to_vec()));
        Ok(())
    }
}
