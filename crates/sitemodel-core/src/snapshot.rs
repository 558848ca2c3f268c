use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SiteModelError};
use crate::traits::{ContentStore, StoreNode, StoreSession};
use crate::types::{ModelEvent, NodeId, NodePath, PropertyValue};

/// Per-node staleness, driven as a pure transition function of
/// `(state, incoming event)`. A structural mark always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Fresh,
    PropertyStale,
    StructurallyStale,
}

impl NodeState {
    fn apply(self, event_is_property: bool) -> NodeState {
        match (self, event_is_property) {
            (_, false) => NodeState::StructurallyStale,
            (NodeState::Fresh, true) => NodeState::PropertyStale,
            (state, true) => state,
        }
    }
}

#[derive(Debug)]
struct SnapshotNode {
    id: NodeId,
    name: String,
    display_name: String,
    kind: String,
    path: NodePath,
    properties: BTreeMap<String, PropertyValue>,
    /// Non-owning back-reference into the arena.
    parent: Option<usize>,
    /// Owned child handles in store insertion order.
    children: Vec<usize>,
    state: NodeState,
}

/// Slab-style node storage; freed slots are reused.
#[derive(Debug)]
struct Arena {
    slots: Vec<Option<SnapshotNode>>,
    free: Vec<usize>,
    root: usize,
}

impl Arena {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: 0,
        }
    }

    fn alloc(&mut self, node: SnapshotNode) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn free_subtree(&mut self, idx: usize) {
        let children = match self.slots[idx].take() {
            Some(node) => node.children,
            None => return,
        };
        self.free.push(idx);
        for child in children {
            self.free_subtree(child);
        }
    }

    fn node(&self, idx: usize) -> &SnapshotNode {
        self.slots[idx]
            .as_ref()
            .unwrap_or_else(|| unreachable!("dangling arena handle {idx}"))
    }

    fn node_mut(&mut self, idx: usize) -> &mut SnapshotNode {
        self.slots[idx]
            .as_mut()
            .unwrap_or_else(|| unreachable!("dangling arena handle {idx}"))
    }

    fn child_by_name(&self, idx: usize, name: &str) -> Option<usize> {
        self.node(idx)
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).name == name)
    }

    fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Owned, immutable deep copy of one snapshot subtree, safe to hand to
/// consumers outside the tree lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigNodeData {
    pub id: NodeId,
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub path: NodePath,
    pub properties: BTreeMap<String, PropertyValue>,
    pub children: Vec<ConfigNodeData>,
}

/// Borrowed view on one node, valid for the duration of a
/// [`NodeSnapshotTree::read`] closure.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    arena: &'a Arena,
    idx: usize,
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> NodeId {
        self.arena.node(self.idx).id
    }

    pub fn name(&self) -> &'a str {
        &self.arena.node(self.idx).name
    }

    pub fn display_name(&self) -> &'a str {
        &self.arena.node(self.idx).display_name
    }

    pub fn kind(&self) -> &'a str {
        &self.arena.node(self.idx).kind
    }

    pub fn path(&self) -> &'a NodePath {
        &self.arena.node(self.idx).path
    }

    pub fn properties(&self) -> &'a BTreeMap<String, PropertyValue> {
        &self.arena.node(self.idx).properties
    }

    pub fn property(&self, name: &str) -> Option<&'a PropertyValue> {
        self.arena.node(self.idx).properties.get(name)
    }

    pub fn parent(&self) -> Option<NodeRef<'a>> {
        self.arena.node(self.idx).parent.map(|idx| NodeRef {
            arena: self.arena,
            idx,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + '_ {
        let arena = self.arena;
        self.arena
            .node(self.idx)
            .children
            .iter()
            .map(move |&idx| NodeRef { arena, idx })
    }

    pub fn child(&self, name: &str) -> Option<NodeRef<'a>> {
        self.arena.child_by_name(self.idx, name).map(|idx| NodeRef {
            arena: self.arena,
            idx,
        })
    }

    /// Resolve a `/`-separated relative path below this node.
    pub fn node(&self, relative: &str) -> Option<NodeRef<'a>> {
        let mut current = *self;
        for seg in relative.split('/').filter(|s| !s.is_empty()) {
            current = current.child(seg)?;
        }
        Some(current)
    }

    pub fn to_data(&self) -> ConfigNodeData {
        let node = self.arena.node(self.idx);
        ConfigNodeData {
            id: node.id,
            name: node.name.clone(),
            display_name: node.display_name.clone(),
            kind: node.kind.clone(),
            path: node.path.clone(),
            properties: node.properties.clone(),
            children: self.children().map(|c| c.to_data()).collect(),
        }
    }
}

/// Read access to a consistent snapshot, scoped by the tree's coarse lock.
pub struct TreeReader<'a> {
    arena: &'a Arena,
    root_path: &'a NodePath,
}

impl<'a> TreeReader<'a> {
    pub fn root(&self) -> NodeRef<'a> {
        NodeRef {
            arena: self.arena,
            idx: self.arena.root,
        }
    }

    pub fn node_at(&self, path: &NodePath) -> Option<NodeRef<'a>> {
        let segments = self.root_path.relative_segments(path)?;
        let mut current = self.root();
        for seg in segments {
            current = current.child(seg)?;
        }
        Some(current)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    pub live_nodes: usize,
    pub full_loads: u64,
    pub reconcile_passes: u64,
}

#[derive(Default)]
struct TreeInner {
    arena: Option<Arena>,
    pending: HashSet<ModelEvent>,
    full_loads: u64,
    reconcile_passes: u64,
}

/// One detached, in-memory snapshot of a designated root subtree, kept
/// consistent by applying queued events in a minimal reconciliation pass
/// at the start of every read.
///
/// A single coarse lock guards the whole read-reconcile-return sequence;
/// reloads are rare relative to reads, so read concurrency is traded for
/// correctness.
pub struct NodeSnapshotTree {
    store: Arc<dyn ContentStore>,
    root_path: NodePath,
    excluded_child: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    inner: Mutex<TreeInner>,
}

impl NodeSnapshotTree {
    pub fn new(store: Arc<dyn ContentStore>, root_path: NodePath) -> Self {
        Self {
            store,
            root_path,
            excluded_child: Arc::new(|_| false),
            inner: Mutex::new(TreeInner::default()),
        }
    }

    /// Skip children the deployment excludes from the model (e.g. a
    /// security area), by name, at every level.
    pub fn with_excluded_children(mut self, names: Vec<String>) -> Self {
        self.excluded_child = Arc::new(move |name: &str| names.iter().any(|n| n == name));
        self
    }

    pub fn with_excluded_predicate(
        mut self,
        predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    ) -> Self {
        self.excluded_child = predicate;
        self
    }

    pub fn root_path(&self) -> &NodePath {
        &self.root_path
    }

    /// Queue drained collector events for the next read.
    pub fn queue_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = ModelEvent>,
    {
        self.inner.lock().pending.extend(events);
    }

    /// Run `f` against a consistent snapshot, loading or reconciling first
    /// as needed. The coarse lock is held for the whole call.
    pub fn read<R>(&self, f: impl FnOnce(TreeReader<'_>) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.lock();
        self.sync(&mut inner)?;
        let arena = inner
            .arena
            .as_ref()
            .unwrap_or_else(|| unreachable!("sync left no arena"));
        f(TreeReader {
            arena,
            root_path: &self.root_path,
        })
    }

    /// Owned deep copy of the subtree at `path`.
    pub fn get_node(&self, path: &NodePath) -> Result<ConfigNodeData> {
        self.read(|reader| {
            reader
                .node_at(path)
                .map(|n| n.to_data())
                .ok_or_else(|| SiteModelError::NodeNotFound(path.clone()))
        })
    }

    pub fn stats(&self) -> TreeStats {
        let inner = self.inner.lock();
        TreeStats {
            live_nodes: inner.arena.as_ref().map(|a| a.live_count()).unwrap_or(0),
            full_loads: inner.full_loads,
            reconcile_passes: inner.reconcile_passes,
        }
    }

    fn sync(&self, inner: &mut TreeInner) -> Result<()> {
        if inner.arena.is_none() {
            let arena = self.full_load()?;
            info!(root = %self.root_path, nodes = arena.live_count(), "loaded configuration subtree");
            inner.arena = Some(arena);
            inner.full_loads += 1;
            // Events accumulated before or during the full load are covered
            // by the load itself.
            inner.pending.clear();
            return Ok(());
        }
        if inner.pending.is_empty() {
            return Ok(());
        }

        let events = std::mem::take(&mut inner.pending);
        if let Some(arena) = inner.arena.as_mut() {
            for event in &events {
                Self::mark_stale(arena, &self.root_path, event);
            }
        }

        let session = self.store.open_session()?;
        if session.read_node(&self.root_path)?.is_none() {
            inner.arena = None;
            warn!(root = %self.root_path, "watched root vanished, discarding snapshot tree");
            return Err(SiteModelError::RootVanished(self.root_path.clone()));
        }
        let arena = inner
            .arena
            .as_mut()
            .unwrap_or_else(|| unreachable!("checked above"));
        let root = arena.root;
        if let Err(e) = self.reconcile(session.as_ref(), arena, root) {
            // Never serve a half-updated tree.
            inner.arena = None;
            return Err(e);
        }
        inner.reconcile_passes += 1;
        debug!(root = %self.root_path, events = events.len(), "reconciled snapshot tree");
        Ok(())
    }

    fn full_load(&self) -> Result<Arena> {
        let session = self.store.open_session()?;
        let root_node = session
            .read_node(&self.root_path)?
            .ok_or_else(|| SiteModelError::NodeNotFound(self.root_path.clone()))?;
        let mut arena = Arena::new();
        let root = arena.alloc(Self::fresh_node(&root_node, None));
        arena.root = root;
        self.load_children(session.as_ref(), &mut arena, root)?;
        Ok(arena)
    }

    fn load_children(&self, session: &dyn StoreSession, arena: &mut Arena, idx: usize) -> Result<()> {
        let path = arena.node(idx).path.clone();
        let listing = session.read_children(&path)?;
        if !listing.is_consistent() {
            return Err(SiteModelError::LoadInconsistency {
                path,
                declared: listing.declared_count,
                enumerated: listing.children.len(),
            });
        }
        for child in &listing.children {
            if (self.excluded_child)(child.path.name()) {
                continue;
            }
            let child_idx = arena.alloc(Self::fresh_node(child, Some(idx)));
            arena.node_mut(idx).children.push(child_idx);
            self.load_children(session, arena, child_idx)?;
        }
        Ok(())
    }

    fn fresh_node(store_node: &StoreNode, parent: Option<usize>) -> SnapshotNode {
        SnapshotNode {
            id: store_node.id,
            name: store_node.path.name().to_string(),
            display_name: display_name(store_node.path.name(), &store_node.properties),
            kind: store_node.kind.clone(),
            path: store_node.path.clone(),
            properties: store_node.properties.clone(),
            parent,
            children: Vec::new(),
            state: NodeState::Fresh,
        }
    }

    /// Mark the node at the event path, or its nearest existing ancestor,
    /// stale according to the event kind.
    fn mark_stale(arena: &mut Arena, root_path: &NodePath, event: &ModelEvent) {
        let mut target = event.path.clone();
        let idx = loop {
            if let Some(idx) = Self::resolve(arena, root_path, &target) {
                break idx;
            }
            match target.parent() {
                Some(parent) => target = parent,
                None => return,
            }
        };
        let node = arena.node_mut(idx);
        node.state = node.state.apply(event.property);
    }

    fn resolve(arena: &Arena, root_path: &NodePath, path: &NodePath) -> Option<usize> {
        let segments = root_path.relative_segments(path)?;
        let mut idx = arena.root;
        for seg in segments {
            idx = arena.child_by_name(idx, seg)?;
        }
        Some(idx)
    }

    /// One reconciliation pass. Structurally stale nodes re-list their
    /// children from the store, preserving still-existing child snapshots
    /// by name; property-stale nodes refresh their own properties; every
    /// surviving child is visited, since deeper nodes may carry their own
    /// staleness.
    fn reconcile(&self, session: &dyn StoreSession, arena: &mut Arena, idx: usize) -> Result<()> {
        let (state, path) = {
            let node = arena.node(idx);
            (node.state, node.path.clone())
        };

        match state {
            NodeState::StructurallyStale => {
                match session.read_node(&path)? {
                    None => {
                        // Backing node is gone; drop this subtree.
                        Self::detach(arena, idx);
                        return Ok(());
                    }
                    Some(store_node) => {
                        Self::refresh_own(arena.node_mut(idx), &store_node);
                    }
                }
                self.reconcile_children(session, arena, idx, &path)?;
            }
            NodeState::PropertyStale => match session.read_node(&path)? {
                None => {
                    Self::detach(arena, idx);
                    return Ok(());
                }
                Some(store_node) => {
                    Self::refresh_own(arena.node_mut(idx), &store_node);
                }
            },
            NodeState::Fresh => {}
        }

        arena.node_mut(idx).state = NodeState::Fresh;
        let children = arena.node(idx).children.clone();
        for child in children {
            // A child dropped by a sibling pass cannot occur: handles are
            // only freed by their own parent, which is this node.
            self.reconcile(session, arena, child)?;
        }
        Ok(())
    }

    /// Re-list the children of `idx` from the store, preserving existing
    /// snapshots by name, creating only genuinely new children, dropping
    /// vanished ones, and adopting the store's ordering.
    fn reconcile_children(
        &self,
        session: &dyn StoreSession,
        arena: &mut Arena,
        idx: usize,
        path: &NodePath,
    ) -> Result<()> {
        let listing = session.read_children(path)?;
        if !listing.is_consistent() {
            return Err(SiteModelError::LoadInconsistency {
                path: path.clone(),
                declared: listing.declared_count,
                enumerated: listing.children.len(),
            });
        }

        let old_children = std::mem::take(&mut arena.node_mut(idx).children);
        let mut new_children = Vec::with_capacity(listing.children.len());
        let mut kept: HashSet<usize> = HashSet::new();

        for child in &listing.children {
            let name = child.path.name();
            if (self.excluded_child)(name) {
                continue;
            }
            let existing = old_children
                .iter()
                .copied()
                .find(|&c| arena.node(c).name == name);
            match existing {
                Some(child_idx) => {
                    // Preserve the sub-snapshot; refresh identity and
                    // properties from the listing already in hand, since a
                    // same-path replacement carries a new identifier.
                    Self::refresh_own(arena.node_mut(child_idx), child);
                    kept.insert(child_idx);
                    new_children.push(child_idx);
                }
                None => {
                    let child_idx = arena.alloc(Self::fresh_node(child, Some(idx)));
                    new_children.push(child_idx);
                    self.load_children(session, arena, child_idx)?;
                }
            }
        }

        for old in old_children {
            if !kept.contains(&old) {
                debug!(path = %arena.node(old).path, "dropping vanished child snapshot");
                arena.free_subtree(old);
            }
        }
        arena.node_mut(idx).children = new_children;
        Ok(())
    }

    fn refresh_own(node: &mut SnapshotNode, store_node: &StoreNode) {
        node.id = store_node.id;
        node.kind = store_node.kind.clone();
        node.properties = store_node.properties.clone();
        node.display_name = display_name(&node.name, &node.properties);
    }

    fn detach(arena: &mut Arena, idx: usize) {
        if let Some(parent) = arena.node(idx).parent {
            arena.node_mut(parent).children.retain(|&c| c != idx);
        }
        arena.free_subtree(idx);
    }
}

/// Display name resolution: the `displayname` property with `${prop}`
/// placeholders substituted from the node's own property map, falling back
/// to the raw node name.
fn display_name(name: &str, properties: &BTreeMap<String, PropertyValue>) -> String {
    let template = match properties.get("displayname").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return name.to_string(),
    };
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match properties.get(key).and_then(|v| v.as_str()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
