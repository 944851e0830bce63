//! Structured lifecycle events for cache resolution and selective testing.
//!
//! Every event carries an `event` field so log pipelines can filter on it,
//! e.g. `event=node.degraded`.

use tracing::{info, info_span, warn, Span};
use uuid::Uuid;

use crate::graph::NodeId;

/// Span tagged with one resolve invocation id.
///
/// Resolution is async, so the span is attached to the resolve future with
/// [`tracing::Instrument`] rather than entered on the current thread.
#[derive(Debug, Clone)]
pub struct ResolveSpan {
    invocation_id: Uuid,
    span: Span,
}

impl ResolveSpan {
    pub fn new(invocation_id: Uuid) -> Self {
        Self {
            invocation_id,
            span: info_span!("modcache.resolve", invocation_id = %invocation_id),
        }
    }

    /// Span with a fresh v4 invocation id.
    pub fn new_invocation() -> Self {
        Self::new(Uuid::new_v4())
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

pub fn emit_resolve_started(graph: &str, nodes: usize) {
    info!(event = "resolve.started", graph = %graph, nodes = nodes);
}

pub fn emit_resolve_finished(graph: &str, fetched: usize, build_required: usize, duration_ms: u64) {
    info!(
        event = "resolve.finished",
        graph = %graph,
        fetched = fetched,
        build_required = build_required,
        duration_ms = duration_ms,
    );
}

/// A node reached its terminal state.
pub fn emit_node_resolved(node: &NodeId, fingerprint: &str, state: &str) {
    info!(event = "node.resolved", node = %node, fingerprint = %fingerprint, state = %state);
}

/// A cache failure downgraded a node to a rebuild.
pub fn emit_node_degraded(node: &NodeId, error: &dyn std::fmt::Display) {
    warn!(event = "node.degraded", node = %node, error = %error);
}

pub fn emit_tests_partitioned(to_run: usize, to_skip: usize) {
    info!(event = "tests.partitioned", to_run = to_run, to_skip = to_skip);
}

pub fn emit_tests_persist_failed(error: &dyn std::fmt::Display) {
    warn!(event = "tests.persist_failed", error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_span_keeps_its_invocation_id() {
        let id = Uuid::new_v4();
        let span = ResolveSpan::new(id);
        assert_eq!(span.invocation_id(), id);
        let _entered = span.span().enter();
        emit_resolve_started("app", 3);
    }

    #[test]
    fn fresh_invocations_differ() {
        let a = ResolveSpan::new_invocation().invocation_id();
        let b = ResolveSpan::new_invocation().invocation_id();
        assert_ne!(a, b);
    }
}
