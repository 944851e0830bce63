//! modcache-store: fingerprint-keyed artifact cache.
//!
//! A [`CacheStore`] composes a [`LocalCache`] directory with an optional
//! [`RemoteTier`]. Lookups hit the local tier first; verified remote hits are
//! written through locally so later lookups avoid the network.

pub mod artifact;
pub mod digest;
pub mod error;
pub mod fakes;
pub mod local;
pub mod remote;
pub mod store;

pub use artifact::{Artifact, CacheEntry};
pub use digest::{Digest, Fingerprint};
pub use error::{CacheError, Result};
pub use fakes::MemoryRemoteCache;
pub use local::LocalCache;
pub use remote::{HttpRemoteCache, RemoteConfig, SignedLocation, UploadRequest};
pub use store::{CacheStore, Materialized, RemoteTier, StoreOutcome, Tier};
