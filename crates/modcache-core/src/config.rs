//! Runtime configuration from environment variables or a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use modcache_store::{
    CacheError, CacheStore, Fingerprint, HttpRemoteCache, LocalCache, RemoteConfig, RemoteTier,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::controller::{default_concurrency, ControllerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] CacheError),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModcacheConfig {
    /// Root of the local artifact tier.
    pub cache_dir: PathBuf,
    /// Where selective-testing records live.
    pub state_dir: PathBuf,
    pub max_concurrency: usize,
    /// Extra strings mixed into every fingerprint, e.g. the toolchain version.
    pub hash_salt: Vec<String>,
    pub local_max_age_days: u64,
    pub local_max_entries: Option<usize>,
    pub remote: Option<RemoteConfig>,
}

fn base_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("modcache")
}

impl Default for ModcacheConfig {
    fn default() -> Self {
        let base = base_dir();
        Self {
            cache_dir: base.join("artifacts"),
            state_dir: base.join("state"),
            max_concurrency: default_concurrency(),
            hash_salt: Vec::new(),
            local_max_age_days: 7,
            local_max_entries: None,
            remote: None,
        }
    }
}

impl ModcacheConfig {
    /// Defaults overridden by `MODCACHE_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = Self::default();
        if let Some(dir) = lookup("MODCACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MODCACHE_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("MODCACHE_CONCURRENCY") {
            config.max_concurrency = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("MODCACHE_CONCURRENCY: `{raw}`")))?;
        }
        if let Some(url) = lookup("MODCACHE_REMOTE_URL") {
            let mut remote = RemoteConfig::new(url);
            if let Some(token) = lookup("MODCACHE_TOKEN") {
                remote = remote.with_token(token);
            }
            if let Some(raw) = lookup("MODCACHE_TIMEOUT_SECS") {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid(format!("MODCACHE_TIMEOUT_SECS: `{raw}`")))?;
                remote = remote.with_timeout(Duration::from_secs(secs));
            }
            config.remote = Some(remote);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(remote) = &self.remote {
            if !(remote.url.starts_with("http://") || remote.url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "remote url must be http(s): {}",
                    remote.url
                )));
            }
        }
        Ok(())
    }

    pub fn local_max_age(&self) -> Duration {
        Duration::from_secs(self.local_max_age_days * 24 * 60 * 60)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrency: self.max_concurrency,
            ..ControllerConfig::default()
        }
    }

    /// Composed store over `cache_dir` and the configured remote, if any.
    /// Stale local entries are evicted first.
    pub fn build_store(&self) -> ConfigResult<CacheStore> {
        let local = LocalCache::new(&self.cache_dir)?;
        self.evict(&local)?;
        let remote = match &self.remote {
            Some(remote) => Some(RemoteTier::Http(HttpRemoteCache::new(remote.clone())?)),
            None => None,
        };
        info!(
            cache_dir = %self.cache_dir.display(),
            remote = remote.is_some(),
            "cache store configured"
        );
        Ok(CacheStore::new(local, remote))
    }

    /// Drop local entries older than `local_max_age_days`, then keep at
    /// most `local_max_entries` of the most recently used.
    pub fn clean_local(&self) -> ConfigResult<Vec<Fingerprint>> {
        self.evict(&LocalCache::new(&self.cache_dir)?)
    }

    fn evict(&self, local: &LocalCache) -> ConfigResult<Vec<Fingerprint>> {
        let evicted = local.clean(Some(self.local_max_age()), self.local_max_entries)?;
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "evicted stale local artifacts");
        }
        Ok(evicted)
    }
}
