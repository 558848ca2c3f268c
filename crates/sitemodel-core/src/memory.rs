use crossbeam_channel::Sender as CbSender;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SiteModelError};
use crate::traits::{ChildListing, ContentStore, StoreNode, StoreSession};
use crate::types::{ChangeKind, NodeId, NodePath, PropertyValue, RawChange};

#[derive(Debug, Clone)]
struct StoredNode {
    id: NodeId,
    kind: String,
    properties: BTreeMap<String, PropertyValue>,
    /// Child names in insertion order.
    children: Vec<String>,
}

/// In-memory [`ContentStore`] used by tests, benches and embedded setups.
///
/// Mutations record [`RawChange`]s; `flush_changes` ships the accumulated
/// batch to every subscribed channel, mimicking the store's best-effort
/// batched notification stream.
pub struct MemoryStore {
    nodes: DashMap<NodePath, StoredNode>,
    pending: Mutex<Vec<RawChange>>,
    subscribers: Mutex<Vec<CbSender<Vec<RawChange>>>>,
    origin_ignorable: AtomicBool,
    /// One-shot declared-count skews keyed by parent path, for exercising
    /// the mid-enumeration consistency check.
    count_skews: DashMap<NodePath, isize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let nodes = DashMap::new();
        nodes.insert(
            NodePath::root(),
            StoredNode {
                id: Uuid::new_v4(),
                kind: "root".to_string(),
                properties: BTreeMap::new(),
                children: Vec::new(),
            },
        );
        Self {
            nodes,
            pending: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            origin_ignorable: AtomicBool::new(false),
            count_skews: DashMap::new(),
        }
    }

    /// Subscribe a channel to future change batches.
    pub fn subscribe(&self, tx: CbSender<Vec<RawChange>>) {
        self.subscribers.lock().push(tx);
    }

    /// Mark changes recorded from now on as coming from an ignorable
    /// origin (e.g. the model's own bookkeeping writes).
    pub fn set_origin_ignorable(&self, ignorable: bool) {
        self.origin_ignorable.store(ignorable, Ordering::SeqCst);
    }

    /// Create a node under an existing parent. Returns its identifier.
    pub fn put_node(&self, path: &NodePath, kind: &str) -> Result<NodeId> {
        let parent_path = path
            .parent()
            .ok_or_else(|| SiteModelError::InvalidPath(path.to_string()))?;
        {
            let mut parent = self
                .nodes
                .get_mut(&parent_path)
                .ok_or_else(|| SiteModelError::NodeNotFound(parent_path.clone()))?;
            let name = path.name().to_string();
            if !parent.children.contains(&name) {
                parent.children.push(name);
            }
        }
        let id = Uuid::new_v4();
        self.nodes.insert(
            path.clone(),
            StoredNode {
                id,
                kind: kind.to_string(),
                properties: BTreeMap::new(),
                children: Vec::new(),
            },
        );
        self.record(path.clone(), ChangeKind::Added);
        Ok(id)
    }

    /// Remove a node and its whole subtree.
    pub fn remove_node(&self, path: &NodePath) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Err(SiteModelError::NodeNotFound(path.clone()));
        }
        if let Some(parent_path) = path.parent() {
            if let Some(mut parent) = self.nodes.get_mut(&parent_path) {
                let name = path.name().to_string();
                parent.children.retain(|c| c != &name);
            }
        }
        let doomed: Vec<NodePath> = self
            .nodes
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| p == path || path.is_ancestor_of(p))
            .collect();
        for p in doomed {
            self.nodes.remove(&p);
        }
        self.record(path.clone(), ChangeKind::Removed);
        Ok(())
    }

    pub fn set_property(&self, path: &NodePath, name: &str, value: PropertyValue) -> Result<()> {
        let mut node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| SiteModelError::NodeNotFound(path.clone()))?;
        node.properties.insert(name.to_string(), value);
        drop(node);
        // Property notifications carry the property's own path.
        self.record(path.join(name), ChangeKind::PropertyChanged);
        Ok(())
    }

    pub fn id_of(&self, path: &NodePath) -> Option<NodeId> {
        self.nodes.get(path).map(|n| n.id)
    }

    /// Misreport the declared child count of `path` by `delta` for the
    /// next enumeration only.
    pub fn skew_child_count_once(&self, path: &NodePath, delta: isize) {
        self.count_skews.insert(path.clone(), delta);
    }

    /// Ship the accumulated change batch to all subscribers and return it.
    pub fn flush_changes(&self) -> Vec<RawChange> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return batch;
        }
        let subscribers = self.subscribers.lock();
        for tx in subscribers.iter() {
            let _ = tx.send(batch.clone());
        }
        debug!(changes = batch.len(), "flushed change batch");
        batch
    }

    fn record(&self, path: NodePath, kind: ChangeKind) {
        let change = RawChange {
            path,
            kind,
            ignorable: self.origin_ignorable.load(Ordering::SeqCst),
        };
        self.pending.lock().push(change);
    }

    fn store_node(&self, path: &NodePath) -> Option<StoreNode> {
        self.nodes.get(path).map(|n| StoreNode {
            id: n.id,
            path: path.clone(),
            kind: n.kind.clone(),
            properties: n.properties.clone(),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySession<'a> {
    store: &'a MemoryStore,
}

impl StoreSession for MemorySession<'_> {
    fn read_node(&self, path: &NodePath) -> Result<Option<StoreNode>> {
        Ok(self.store.store_node(path))
    }

    fn read_children(&self, path: &NodePath) -> Result<ChildListing> {
        let node = self
            .store
            .nodes
            .get(path)
            .ok_or_else(|| SiteModelError::NodeNotFound(path.clone()))?;
        let names = node.children.clone();
        drop(node);

        let mut declared = names.len() as isize;
        if let Some((_, delta)) = self.store.count_skews.remove(path) {
            declared += delta;
        }

        let mut children = Vec::with_capacity(names.len());
        for name in &names {
            let child_path = path.join(name);
            if let Some(child) = self.store.store_node(&child_path) {
                children.push(child);
            }
        }
        Ok(ChildListing {
            declared_count: declared.max(0) as usize,
            children,
        })
    }
}

impl ContentStore for MemoryStore {
    fn open_session(&self) -> Result<Box<dyn StoreSession + '_>> {
        Ok(Box::new(MemorySession { store: self }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    #[test]
    fn put_and_read_roundtrip() {
        let store = MemoryStore::new();
        store.put_node(&path("/a"), "folder").unwrap();
        store.put_node(&path("/a/b"), "config").unwrap();
        store
            .set_property(&path("/a/b"), "title", "hello".into())
            .unwrap();

        let session = store.open_session().unwrap();
        let node = session.read_node(&path("/a/b")).unwrap().unwrap();
        assert_eq!(node.kind, "config");
        assert_eq!(node.properties["title"].as_str(), Some("hello"));
    }

    #[test]
    fn children_keep_insertion_order() {
        let store = MemoryStore::new();
        store.put_node(&path("/a"), "folder").unwrap();
        for name in ["z", "m", "a"] {
            store.put_node(&path("/a").join(name), "n").unwrap();
        }
        let session = store.open_session().unwrap();
        let listing = session.read_children(&path("/a")).unwrap();
        let names: Vec<_> = listing.children.iter().map(|c| c.path.name().to_string()).collect();
        assert_eq!(names, vec!["z", "m", "a"]);
        assert!(listing.is_consistent());
    }

    #[test]
    fn remove_drops_subtree() {
        let store = MemoryStore::new();
        store.put_node(&path("/a"), "n").unwrap();
        store.put_node(&path("/a/b"), "n").unwrap();
        store.put_node(&path("/a/b/c"), "n").unwrap();
        store.remove_node(&path("/a/b")).unwrap();

        let session = store.open_session().unwrap();
        assert!(session.read_node(&path("/a/b/c")).unwrap().is_none());
        assert!(session.read_node(&path("/a")).unwrap().is_some());
    }

    #[test]
    fn changes_are_batched_to_subscribers() {
        let store = MemoryStore::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        store.subscribe(tx);

        store.put_node(&path("/a"), "n").unwrap();
        store.set_property(&path("/a"), "x", PropertyValue::Long(1)).unwrap();
        store.flush_changes();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].kind, ChangeKind::Added);
        assert_eq!(batch[1].kind, ChangeKind::PropertyChanged);
        assert_eq!(batch[1].path, path("/a/x"));
    }

    #[test]
    fn count_skew_is_one_shot() {
        let store = MemoryStore::new();
        store.put_node(&path("/a"), "n").unwrap();
        store.put_node(&path("/a/b"), "n").unwrap();
        store.skew_child_count_once(&path("/a"), 1);

        let session = store.open_session().unwrap();
        let first = session.read_children(&path("/a")).unwrap();
        assert!(!first.is_consistent());
        let second = session.read_children(&path("/a")).unwrap();
        assert!(second.is_consistent());
    }

    #[test]
    fn ignorable_origin_is_stamped() {
        let store = MemoryStore::new();
        store.set_origin_ignorable(true);
        store.put_node(&path("/a"), "n").unwrap();
        store.set_origin_ignorable(false);
        store.put_node(&path("/b"), "n").unwrap();

        let batch = store.flush_changes();
        assert!(batch[0].ignorable);
        assert!(!batch[1].ignorable);
    }
}
