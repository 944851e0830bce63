//! Cache counters for one controller.
//!
//! Counters are incremented silently; [`CacheMetrics::flush`] emits their
//! current values as a single `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters, shared by reference or `Arc`.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    degraded: AtomicU64,
    uploads: AtomicU64,
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub degraded: u64,
    pub uploads: u64,
}

impl CacheMetrics {
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            local_hits: AtomicU64::new(0),
            remote_hits: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
        }
    }

    pub fn inc_local_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_remote_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A cache error forced a rebuild.
    pub fn inc_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "degraded", "counter incremented");
    }

    pub fn inc_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as one `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            hits = s.hits,
            misses = s.misses,
            local_hits = s.local_hits,
            remote_hits = s.remote_hits,
            degraded = s.degraded,
            uploads = s.uploads,
        );
    }
}
