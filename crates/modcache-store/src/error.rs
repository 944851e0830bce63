//! Error types for the artifact cache tiers.

use thiserror::Error;

use crate::digest::Digest;

/// Errors produced by the local and remote cache tiers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Network failure, timeout, auth rejection or malformed response.
    #[error("cache transport error: {0}")]
    Transport(String),

    /// Downloaded or stored bytes do not hash to the advertised digest.
    #[error("artifact verification failed: expected {expected}, got {actual}")]
    Verification { expected: Digest, actual: Digest },

    /// The remote answered with a status the protocol does not allow here.
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Transport(err.to_string())
    }
}

impl CacheError {
    /// True for failures that only cost performance and should degrade a
    /// single lookup to a miss rather than abort the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::Transport(_) | CacheError::Verification { .. } | CacheError::Status { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
