use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::NodePath;

/// Deployment-level model configuration. Defaults match the common layout
/// of one `/configurations` collection with a `security` area excluded
/// from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Absolute path of the watched configurations collection.
    pub configurations_root: String,
    /// Child names skipped at every level of the snapshot tree.
    pub excluded_children: Vec<String>,
    /// Absolute subtrees whose events the collector drops entirely.
    pub excluded_subtrees: Vec<String>,
    /// Capacity of each per-kind derived cache.
    pub derived_cache_capacity: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            configurations_root: "/configurations".to_string(),
            excluded_children: vec!["security".to_string()],
            excluded_subtrees: vec!["/configurations/security".to_string()],
            derived_cache_capacity: 4096,
        }
    }
}

impl ModelConfig {
    pub fn configurations_root_path(&self) -> Result<NodePath> {
        NodePath::parse(&self.configurations_root)
    }

    pub fn excluded_subtree_paths(&self) -> Result<Vec<NodePath>> {
        self.excluded_subtrees
            .iter()
            .map(|p| NodePath::parse(p))
            .collect()
    }
}
