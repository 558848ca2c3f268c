use thiserror::Error;

use crate::types::NodePath;

#[derive(Error, Debug)]
pub enum SiteModelError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodePath),

    #[error("inconsistent child listing at {path}: declared {declared}, enumerated {enumerated}")]
    LoadInconsistency {
        path: NodePath,
        declared: usize,
        enumerated: usize,
    },

    #[error("watched root vanished: {0}")]
    RootVanished(NodePath),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SiteModelError>;
