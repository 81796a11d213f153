// error.rs — Error taxonomy for the fusion engine
//
// Only `NotAcyclic` and `OracleMismatch` abort a run. The capacity, missing
// attribute and duplication variants are produced locally, turned into
// diagnostics, and the run continues with the next candidate.

use std::path::PathBuf;

use thiserror::Error;

use crate::id::NodeId;

pub type Result<T> = std::result::Result<T, FusionError>;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("graph is not acyclic: {} node(s) left unsorted ({stuck:?})", stuck.len())]
    NotAcyclic { stuck: Vec<NodeId> },

    #[error("reachability oracle covers {oracle} node(s) but the graph has {graph}")]
    OracleMismatch { oracle: usize, graph: usize },

    #[error("group {group} would grow to {size} member(s), limit is {limit}")]
    GroupCapacityExceeded {
        group: i64,
        size: usize,
        limit: usize,
    },

    #[error("node {node} is missing attribute '{attr}'")]
    NodeAttributeMissing { node: NodeId, attr: &'static str },

    #[error("node {node} ('{op}') would need duplication, which is disabled")]
    DuplicationDisallowed { node: NodeId, op: String },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FusionError {
    /// Whether this error aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FusionError::NotAcyclic { .. } | FusionError::OracleMismatch { .. }
        )
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FusionError::Io {
            path: path.into(),
            source,
        }
    }
}
