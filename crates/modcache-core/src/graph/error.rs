//! Error types for graph construction and traversal.

use thiserror::Error;

use crate::graph::NodeId;

/// Errors produced by the graph model and traverser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The active-edge subgraph is not a DAG. `path` is the cycle itself,
    /// without repeating the first node at the end.
    #[error("dependency cycle detected: {}", render_cycle(.path))]
    CycleDetected { path: Vec<NodeId> },

    /// An edge or query referenced a node absent from the graph.
    #[error("node not found in graph: {0}")]
    UnknownNode(NodeId),

    /// Two nodes were declared with the same identity.
    #[error("node declared twice: {0}")]
    DuplicateNode(NodeId),

    /// Node names must be non-empty and free of `:` so that the
    /// `container:name` form parses back to the same identity.
    #[error("invalid node name: {0}")]
    InvalidName(NodeId),
}

fn render_cycle(path: &[NodeId]) -> String {
    let mut rendered: Vec<String> = path.iter().map(ToString::to_string).collect();
    if let Some(first) = path.first() {
        rendered.push(first.to_string());
    }
    rendered.join(" -> ")
}

/// Convenience result alias.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_renders_closed_path() {
        let err = GraphError::CycleDetected {
            path: vec![NodeId::new("App", "A"), NodeId::new("App", "B")],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: App:A -> App:B -> App:A"
        );
    }

    #[test]
    fn unknown_node_error_displays_identity() {
        let err = GraphError::UnknownNode(NodeId::new("Modules/Core", "Core"));
        assert!(err.to_string().contains("Modules/Core:Core"));
    }
}
