//! Artifact payloads and the metadata recorded for each cached fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, Fingerprint};

/// Opaque build output for one node, as produced by the external build step.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// SHA-256 of the artifact bytes, independent of the fingerprint it is
    /// stored under.
    pub fn content_digest(&self) -> Digest {
        Digest::compute(&self.bytes)
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("size", &self.bytes.len())
            .field("digest", &self.content_digest())
            .finish()
    }
}

/// Metadata for one cached artifact. Never mutated once written: a changed
/// artifact has a new fingerprint and therefore a new entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub content_digest: Digest,
    pub size: u64,
    /// Local path or remote URL of the artifact bytes.
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, artifact: &Artifact, location: impl Into<String>) -> Self {
        Self {
            fingerprint,
            content_digest: artifact.content_digest(),
            size: artifact.size(),
            location: location.into(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Check `artifact` against the recorded size and content digest.
    pub fn verify(&self, artifact: &Artifact) -> crate::Result<()> {
        let actual = artifact.content_digest();
        if actual != self.content_digest || artifact.size() != self.size {
            return Err(crate::CacheError::Verification {
                expected: self.content_digest,
                actual,
            });
        }
        Ok(())
    }
}
