//! Error types for content hashing.

use std::path::PathBuf;

use thiserror::Error;

use crate::graph::{GraphError, NodeId};
use crate::schedule::ScheduleError;

#[derive(Debug, Error)]
pub enum HashError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("{node}: cannot read input file {}", .path.display())]
    MissingFile { node: NodeId, path: PathBuf },

    #[error("{node}: invalid build settings: {reason}")]
    InvalidSettings { node: NodeId, reason: String },

    #[error("hashing cancelled")]
    Cancelled,

    #[error("hashing task failed: {0}")]
    Join(String),
}

impl From<ScheduleError> for HashError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Cancelled => HashError::Cancelled,
            ScheduleError::Join(reason) => HashError::Join(reason),
            ScheduleError::Graph(err) => HashError::Graph(err),
        }
    }
}

pub type HashResult<T> = std::result::Result<T, HashError>;
