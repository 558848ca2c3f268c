use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::debug;

use crate::types::{ChangeKind, ModelEvent, NodePath, RawChange};

/// Turns raw, best-effort change notifications into a deduplicated set of
/// coarse [`ModelEvent`]s scoped to one watched subtree.
///
/// Accumulation and draining are independently safe for concurrent
/// producers; no event accepted before a [`drain`](Self::drain) call is
/// ever lost.
pub struct ChangeEventCollector {
    watched_root: NodePath,
    excluded: Vec<NodePath>,
    events: Mutex<HashSet<ModelEvent>>,
}

impl ChangeEventCollector {
    pub fn new(watched_root: NodePath, excluded: Vec<NodePath>) -> Self {
        Self {
            watched_root,
            excluded,
            events: Mutex::new(HashSet::new()),
        }
    }

    /// Ingest one raw notification batch.
    ///
    /// Property notifications coarsen to the owning node. A path seen with
    /// both `Removed` and `Added` in the same batch is treated as a single
    /// structural event on its parent (an apparent reordering), not as two
    /// separate child events.
    pub fn collect_raw(&self, batch: &[RawChange]) {
        let mut moved: HashSet<&NodePath> = HashSet::new();
        {
            let mut added: HashSet<&NodePath> = HashSet::new();
            let mut removed: HashSet<&NodePath> = HashSet::new();
            for change in batch.iter().filter(|c| !c.ignorable) {
                match change.kind {
                    ChangeKind::Added => {
                        added.insert(&change.path);
                    }
                    ChangeKind::Removed => {
                        removed.insert(&change.path);
                    }
                    ChangeKind::PropertyChanged => {}
                }
            }
            moved.extend(added.intersection(&removed).copied());
        }

        let mut events = self.events.lock();
        for change in batch {
            if change.ignorable {
                continue;
            }
            let event = match change.kind {
                ChangeKind::PropertyChanged => match change.path.parent() {
                    Some(owner) => ModelEvent::property(owner),
                    None => continue,
                },
                ChangeKind::Added | ChangeKind::Removed => {
                    if moved.contains(&change.path) {
                        match change.path.parent() {
                            Some(parent) => ModelEvent::structural(parent),
                            None => continue,
                        }
                    } else {
                        ModelEvent::structural(change.path.clone())
                    }
                }
            };
            if self.in_scope(&event.path) {
                events.insert(event);
            }
        }
    }

    /// Inject synthetic structural events, forcing paths to be treated as
    /// changed on the next reload.
    pub fn collect_paths<I>(&self, paths: I)
    where
        I: IntoIterator<Item = NodePath>,
    {
        let mut events = self.events.lock();
        for path in paths {
            if self.in_scope(&path) {
                events.insert(ModelEvent::structural(path));
            }
        }
    }

    /// Atomically take the accumulated event set, leaving the collector
    /// empty.
    pub fn drain(&self) -> HashSet<ModelEvent> {
        let drained = std::mem::take(&mut *self.events.lock());
        if !drained.is_empty() {
            debug!(events = drained.len(), root = %self.watched_root, "drained model events");
        }
        drained
    }

    pub fn pending(&self) -> usize {
        self.events.lock().len()
    }

    fn in_scope(&self, path: &NodePath) -> bool {
        if path == &self.watched_root || !self.watched_root.is_ancestor_of(path) {
            return false;
        }
        !self
            .excluded
            .iter()
            .any(|ex| ex == path || ex.is_ancestor_of(path))
    }
}
