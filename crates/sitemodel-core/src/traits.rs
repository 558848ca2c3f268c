use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{NodeId, NodePath, PropertyValue};

/// One node as read from the backing content store.
#[derive(Debug, Clone)]
pub struct StoreNode {
    pub id: NodeId,
    pub path: NodePath,
    pub kind: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Ordered child listing with the count the store declared before
/// enumeration started, so callers can detect concurrent structural
/// mutation mid-enumeration.
#[derive(Debug, Clone)]
pub struct ChildListing {
    pub declared_count: usize,
    pub children: Vec<StoreNode>,
}

impl ChildListing {
    pub fn is_consistent(&self) -> bool {
        self.declared_count == self.children.len()
    }
}

/// Read-only view on the content store, scoped to one rebuild pass.
///
/// Dropping the session releases the underlying connection; the snapshot
/// tree acquires one lazily per pass and never holds it across passes.
pub trait StoreSession {
    fn read_node(&self, path: &NodePath) -> Result<Option<StoreNode>>;

    /// Children of `path` in the store's insertion order.
    fn read_children(&self, path: &NodePath) -> Result<ChildListing>;
}

/// Hierarchical, versioned content store consumed by the model. The model
/// performs no writes through this boundary.
pub trait ContentStore: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn StoreSession + '_>>;
}
