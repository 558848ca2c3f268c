use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::debug;

use sitemodel_core::{
    ChangeEventCollector, ContentStore, ModelConfig, NodePath, NodeSnapshotTree, RawChange, Result,
};

use crate::derived::DerivedModelCache;

/// Wires the store's notification stream into both cache tiers.
///
/// Raw batches land in the collector as they arrive; `sync` drains the
/// collector once and hands the same event set to the snapshot tree (as
/// pending staleness) and to the derived cache (as eviction input), so the
/// tiers never disagree about which events have been applied.
pub struct ModelDriver {
    changes: Receiver<Vec<RawChange>>,
    collector: Arc<ChangeEventCollector>,
    tree: Arc<NodeSnapshotTree>,
    cache: Arc<DerivedModelCache>,
}

impl ModelDriver {
    pub fn new(
        changes: Receiver<Vec<RawChange>>,
        collector: Arc<ChangeEventCollector>,
        tree: Arc<NodeSnapshotTree>,
        cache: Arc<DerivedModelCache>,
    ) -> Self {
        Self {
            changes,
            collector,
            tree,
            cache,
        }
    }

    /// Build a fully wired driver from deployment configuration: collector
    /// exclusions, the tree's excluded-children predicate and the derived
    /// cache capacity all come from `config`.
    pub fn from_config(
        config: &ModelConfig,
        store: Arc<dyn ContentStore>,
        changes: Receiver<Vec<RawChange>>,
    ) -> Result<Self> {
        let root = config.configurations_root_path()?;
        let collector = Arc::new(ChangeEventCollector::new(
            root.clone(),
            config.excluded_subtree_paths()?,
        ));
        let tree = Arc::new(
            NodeSnapshotTree::new(store, root)
                .with_excluded_children(config.excluded_children.clone()),
        );
        let cache = Arc::new(DerivedModelCache::new(
            tree.clone(),
            config.derived_cache_capacity,
        ));
        Ok(Self {
            changes,
            collector,
            tree,
            cache,
        })
    }

    pub fn tree(&self) -> &Arc<NodeSnapshotTree> {
        &self.tree
    }

    pub fn cache(&self) -> &Arc<DerivedModelCache> {
        &self.cache
    }

    /// Drain every batch currently queued on the notification channel into
    /// the collector. Returns the number of batches ingested.
    pub fn poll_store(&self) -> usize {
        let mut batches = 0;
        while let Ok(batch) = self.changes.try_recv() {
            self.collector.collect_raw(&batch);
            batches += 1;
        }
        if batches > 0 {
            debug!(batches, pending = self.collector.pending(), "ingested change batches");
        }
        batches
    }

    /// Move the collector's accumulated events into the snapshot tree and
    /// the derived cache. Returns the number of events applied.
    pub fn sync(&self) -> usize {
        let events = self.collector.drain();
        if events.is_empty() {
            return 0;
        }
        let count = events.len();
        self.tree.queue_events(events.iter().cloned());
        self.cache.handle_events(&events);
        count
    }

    /// One full propagation pass: ingest queued batches, then apply.
    pub fn refresh(&self) -> usize {
        self.poll_store();
        self.sync()
    }

    /// Force paths to be treated as structurally changed, bypassing the
    /// store's notification stream. Applied on the next `sync`.
    pub fn invalidate_paths<I>(&self, paths: I)
    where
        I: IntoIterator<Item = NodePath>,
    {
        self.collector.collect_paths(paths);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitemodel_core::MemoryStore;

    fn path(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    fn driver() -> (Arc<MemoryStore>, ModelDriver) {
        let store = Arc::new(MemoryStore::new());
        store.put_node(&path("/configurations"), "folder").unwrap();
        store.put_node(&path("/configurations/site1"), "configuration").unwrap();
        store
            .put_node(&path("/configurations/site1/pages"), "folder")
            .unwrap();
        store.flush_changes();

        let (tx, rx) = crossbeam_channel::unbounded();
        store.subscribe(tx);
        let collector = Arc::new(ChangeEventCollector::new(
            path("/configurations"),
            Vec::new(),
        ));
        let tree = Arc::new(NodeSnapshotTree::new(store.clone(), path("/configurations")));
        let cache = Arc::new(DerivedModelCache::new(tree.clone(), 64));
        (store.clone(), ModelDriver::new(rx, collector, tree, cache))
    }

    #[test]
    fn refresh_propagates_store_changes_to_reads() {
        let (store, driver) = driver();
        let site1 = path("/configurations/site1");
        let channel = driver.cache.load_channel(&site1, None, false).unwrap();
        assert!(channel.title.is_some());

        store
            .put_node(&path("/configurations/site1/channel"), "channel")
            .unwrap();
        store
            .set_property(
                &path("/configurations/site1/channel"),
                "title",
                "fresh".into(),
            )
            .unwrap();
        store.flush_changes();
        assert!(driver.refresh() > 0);

        let channel = driver.cache.load_channel(&site1, None, false).unwrap();
        assert_eq!(channel.title.as_deref(), Some("fresh"));
    }

    #[test]
    fn config_builds_a_fully_wired_driver() {
        let store = Arc::new(MemoryStore::new());
        store.put_node(&path("/configurations"), "folder").unwrap();
        store.put_node(&path("/configurations/site1"), "configuration").unwrap();
        store.put_node(&path("/configurations/security"), "security").unwrap();
        store.flush_changes();
        let (tx, rx) = crossbeam_channel::unbounded();
        store.subscribe(tx);

        let driver = ModelDriver::from_config(&ModelConfig::default(), store.clone(), rx).unwrap();

        // The tree honors the configured excluded child names.
        let root = driver.tree().get_node(&path("/configurations")).unwrap();
        assert!(root.children.iter().any(|c| c.name == "site1"));
        assert!(root.children.iter().all(|c| c.name != "security"));

        // The collector honors the configured excluded subtrees.
        store
            .put_node(&path("/configurations/security/acl"), "acl")
            .unwrap();
        store.flush_changes();
        driver.poll_store();
        assert_eq!(driver.sync(), 0);

        // The derived cache is live behind the accessor.
        let channel = driver
            .cache()
            .load_channel(&path("/configurations/site1"), None, false)
            .unwrap();
        assert_eq!(channel.name, "site1");
    }

    #[test]
    fn refresh_without_changes_is_a_no_op() {
        let (_store, driver) = driver();
        assert_eq!(driver.refresh(), 0);
    }

    #[test]
    fn synthetic_invalidation_reaches_the_tree() {
        let (store, driver) = driver();
        driver
            .cache
            .load_components(&path("/configurations/site1"), None, false)
            .unwrap();

        // A change the notification stream never reported.
        store
            .put_node(&path("/configurations/site1/pages/home"), "component")
            .unwrap();
        let _ = store.flush_changes();
        while driver.changes.try_recv().is_ok() {}

        driver.invalidate_paths([path("/configurations/site1/pages")]);
        assert_eq!(driver.sync(), 1);

        let components = driver
            .cache
            .load_components(&path("/configurations/site1"), None, false)
            .unwrap();
        assert!(components.components.contains_key("pages/home"));
    }
}
