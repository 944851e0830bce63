//! HTTP client for the remote cache tier.
//!
//! Wire contract, all requests authenticated with a bearer token when one
//! is configured:
//!
//! - `HEAD <url>/api/cache/<fingerprint>`: existence plus metadata headers
//! - `GET  <url>/api/cache/<fingerprint>`: time-limited download location
//! - `PUT  <url>/api/cache/<fingerprint>`: time-limited upload location
//!
//! Downloads are verified against the HEAD metadata before they are
//! returned.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{Artifact, CacheEntry};
use crate::digest::{Digest, Fingerprint};
use crate::error::{CacheError, Result};

pub const HEADER_CONTENT_DIGEST: &str = "x-content-digest";
pub const HEADER_CONTENT_SIZE: &str = "x-content-size";
pub const HEADER_CREATED_AT: &str = "x-created-at";
pub const HEADER_EXPIRES_AT: &str = "x-expires-at";

/// Remote cache connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base server URL, e.g. `https://cache.example.com`.
    pub url: String,
    /// Bearer token; public caches may omit it.
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Set authentication token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }
}

/// Time-limited location returned by the GET and PUT endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLocation {
    pub url: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl SignedLocation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }
}

/// Body of the PUT request announcing an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub content_digest: Digest,
    pub size: u64,
}

/// Remote cache client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemoteCache {
    config: RemoteConfig,
    http_client: reqwest::Client,
}

impl HttpRemoteCache {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("modcache/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn endpoint(&self, fingerprint: &Fingerprint) -> String {
        format!(
            "{}/api/cache/{}",
            self.config.url.trim_end_matches('/'),
            fingerprint.to_hex()
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Existence and metadata. Server-side errors other than auth failures
    /// are reported as absent: they only cost a rebuild.
    pub async fn head(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let url = self.endpoint(fingerprint);
        let response = self.authorized(self.http_client.head(&url)).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        reject_auth(status, &url)?;
        if !status.is_success() {
            debug!(
                fingerprint = %fingerprint.short(),
                status = status.as_u16(),
                "remote HEAD treated as miss"
            );
            return Ok(None);
        }

        entry_from_headers(*fingerprint, &url, response.headers()).map(Some)
    }

    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.head(fingerprint).await?.is_some())
    }

    /// Download and verify. `Ok(None)` when the remote has no entry.
    pub async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        let Some(entry) = self.head(fingerprint).await? else {
            return Ok(None);
        };
        self.download(fingerprint, &entry).await
    }

    /// Download the artifact and verify it against `entry`, the metadata of
    /// an earlier [`HttpRemoteCache::head`].
    pub async fn download(
        &self,
        fingerprint: &Fingerprint,
        entry: &CacheEntry,
    ) -> Result<Option<Artifact>> {
        let url = self.endpoint(fingerprint);
        let response = self.authorized(self.http_client.get(&url)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // evicted between HEAD and GET
            return Ok(None);
        }
        reject_auth(status, &url)?;
        if !status.is_success() {
            return Err(CacheError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let location: SignedLocation = response.json().await?;
        if location.is_expired_at(Utc::now()) {
            return Err(CacheError::Transport(format!(
                "retrieval location for {} already expired",
                fingerprint.short()
            )));
        }

        let body = self
            .http_client
            .get(&location.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let artifact = Artifact::new(body.to_vec());
        entry.verify(&artifact)?;

        debug!(fingerprint = %fingerprint.short(), size = artifact.size(), "downloaded artifact");
        Ok(Some(artifact))
    }

    /// Upload `artifact`. Re-uploading identical content is skipped.
    pub async fn store(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<()> {
        let content_digest = artifact.content_digest();
        if let Some(existing) = self.head(fingerprint).await? {
            if existing.content_digest == content_digest {
                debug!(fingerprint = %fingerprint.short(), "remote already has artifact");
                return Ok(());
            }
        }

        let url = self.endpoint(fingerprint);
        let request = UploadRequest {
            content_digest,
            size: artifact.size(),
        };
        let response = self
            .authorized(self.http_client.put(&url).json(&request))
            .send()
            .await?;
        let status = response.status();
        reject_auth(status, &url)?;
        if !status.is_success() {
            return Err(CacheError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let location: SignedLocation = response.json().await?;
        if location.is_expired_at(Utc::now()) {
            return Err(CacheError::Transport(format!(
                "upload location for {} already expired",
                fingerprint.short()
            )));
        }

        self.http_client
            .put(&location.url)
            .body(artifact.bytes().to_vec())
            .send()
            .await?
            .error_for_status()?;

        info!(fingerprint = %fingerprint.short(), size = artifact.size(), "uploaded artifact");
        Ok(())
    }
}

fn reject_auth(status: StatusCode, url: &str) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CacheError::Transport(format!(
            "authentication rejected ({}) by {url}",
            status.as_u16()
        )));
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn entry_from_headers(
    fingerprint: Fingerprint,
    url: &str,
    headers: &HeaderMap,
) -> Result<CacheEntry> {
    let content_digest: Digest = header_str(headers, HEADER_CONTENT_DIGEST)
        .ok_or_else(|| CacheError::Transport(format!("{url}: missing {HEADER_CONTENT_DIGEST}")))?
        .parse()
        .map_err(|_| CacheError::Transport(format!("{url}: malformed {HEADER_CONTENT_DIGEST}")))?;
    let size = header_str(headers, HEADER_CONTENT_SIZE)
        .and_then(|raw| raw.parse::<u64>().ok())
        .ok_or_else(|| CacheError::Transport(format!("{url}: missing {HEADER_CONTENT_SIZE}")))?;

    Ok(CacheEntry {
        fingerprint,
        content_digest,
        size,
        location: url.to_string(),
        created_at: parse_time(header_str(headers, HEADER_CREATED_AT)).unwrap_or_else(Utc::now),
        expires_at: parse_time(header_str(headers, HEADER_EXPIRES_AT)),
    })
}
