//! Dependency graph of buildable modules.
//!
//! [`Graph`] is an immutable snapshot built through [`GraphBuilder`];
//! [`GraphTraverser`] answers dependency queries for one build platform.

pub mod error;
pub mod model;
pub mod traverser;

pub use error::{GraphError, GraphResult};
pub use model::{
    Edge, Graph, GraphBuilder, GraphSnapshot, Node, NodeId, NodeKind, NodeOrigin, Platform,
    PlatformCondition,
};
pub use traverser::{GraphTraverser, NodeFilter, TopologicalIter, TopologicalOrder};
