//! modcache core library
//!
//! Fingerprints the nodes of a module dependency graph, resolves them
//! against a [`modcache_store::CacheStore`], and decides which test nodes
//! can be skipped because their fingerprint already passed.

pub mod config;
pub mod controller;
pub mod graph;
pub mod hasher;
pub mod metrics;
pub mod obs;
pub mod schedule;
pub mod selective;
pub mod telemetry;

pub use config::{ConfigError, ConfigResult, ModcacheConfig};

pub use controller::{
    default_concurrency, ArtifactBuilder, BuildReason, CacheController, ControllerConfig,
    ControllerError, ControllerResult, NodeState, Resolution, WarmReport,
};

pub use graph::{
    Edge, Graph, GraphBuilder, GraphError, GraphResult, GraphSnapshot, GraphTraverser, Node,
    NodeFilter, NodeId, NodeKind, NodeOrigin, Platform, PlatformCondition, TopologicalOrder,
};

pub use hasher::{ContentHasher, FileReader, FingerprintBreakdown, HashError, HashResult};

pub use metrics::{CacheMetrics, MetricsSnapshot};

pub use schedule::{run_ready_queue, CancelHandle, CancelSignal, ReadyNode, ScheduleError};

pub use selective::{
    Partition, SelectiveError, SelectiveResult, SelectiveTestStore, SelectiveTesting,
};

pub use modcache_store::{
    Artifact, CacheEntry, CacheError, CacheStore, Digest, Fingerprint, LocalCache, Materialized,
    MemoryRemoteCache, RemoteConfig, RemoteTier, StoreOutcome, Tier,
};
