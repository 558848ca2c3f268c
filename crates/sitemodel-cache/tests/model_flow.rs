//! Full-pipeline tests: store notifications through the collector and
//! driver into the snapshot tree and the derived caches.

use std::sync::Arc;

use sitemodel_cache::{DerivedModelCache, ModelDriver};
use sitemodel_core::{
    ChangeEventCollector, InheritanceResolver, MemoryStore, NodePath, NodeSnapshotTree,
    PropertyValue, INHERITS_FROM_PROPERTY,
};

fn path(s: &str) -> NodePath {
    NodePath::parse(s).unwrap()
}

struct Model {
    store: Arc<MemoryStore>,
    tree: Arc<NodeSnapshotTree>,
    cache: Arc<DerivedModelCache>,
    driver: ModelDriver,
}

fn model(setup: impl FnOnce(&MemoryStore)) -> Model {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(MemoryStore::new());
    store.put_node(&path("/configurations"), "folder").unwrap();
    setup(&store);
    store.flush_changes();

    let (tx, rx) = crossbeam_channel::unbounded();
    store.subscribe(tx);
    let collector = Arc::new(ChangeEventCollector::new(
        path("/configurations"),
        Vec::new(),
    ));
    let tree = Arc::new(NodeSnapshotTree::new(store.clone(), path("/configurations")));
    let cache = Arc::new(DerivedModelCache::new(tree.clone(), 128));
    let driver = ModelDriver::new(rx, collector, tree.clone(), cache.clone());
    Model {
        store,
        tree,
        cache,
        driver,
    }
}

fn add(store: &MemoryStore, p: &str) {
    store.put_node(&path(p), "node").unwrap();
}

#[test]
fn direct_children_only_without_inheritance_or_default() {
    let m = model(|store| {
        add(store, "/configurations/site1");
        add(store, "/configurations/site1/pages");
        add(store, "/configurations/site1/pages/home");
        add(store, "/configurations/site1/pages/news");
        // A default root exists but carries no pages node, so it must
        // contribute nothing.
        add(store, "/configurations/default");
    });

    m.tree
        .read(|reader| {
            let resolver =
                InheritanceResolver::new(&reader, &path("/configurations/site1"), &["pages"])?;
            let composites = resolver.composite_nodes();
            assert_eq!(composites.len(), 1);
            let names: Vec<&str> = composites[0]
                .children
                .iter()
                .map(|(n, _)| n.as_str())
                .collect();
            assert_eq!(names, vec!["home", "news"]);

            let expected = vec![
                m.store.id_of(&path("/configurations/site1/pages")).unwrap(),
                m.store
                    .id_of(&path("/configurations/site1/pages/home"))
                    .unwrap(),
                m.store
                    .id_of(&path("/configurations/site1/pages/news"))
                    .unwrap(),
                m.store.id_of(&path("/configurations/site1")).unwrap(),
            ];
            assert_eq!(resolver.cache_key().ids(), expected.as_slice());
            Ok(())
        })
        .unwrap();
}

#[test]
fn repeated_loads_share_one_entry() {
    let m = model(|store| {
        add(store, "/configurations/site1");
        add(store, "/configurations/site1/pages");
        add(store, "/configurations/site1/pages/home");
    });

    let site1 = path("/configurations/site1");
    let first = m.cache.load_components(&site1, None, false).unwrap();
    let second = m.cache.load_components(&site1, None, false).unwrap();
    assert_eq!(first, second);

    let stats = m.cache.stats().components;
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn change_under_one_root_leaves_other_roots_cached() {
    let m = model(|store| {
        for root in ["site1", "site2"] {
            add(store, &format!("/configurations/{root}"));
            add(store, &format!("/configurations/{root}/pages"));
            add(store, &format!("/configurations/{root}/pages/home"));
        }
    });

    let site1 = path("/configurations/site1");
    let site2 = path("/configurations/site2");
    m.cache.load_components(&site1, None, false).unwrap();
    m.cache.load_components(&site2, None, false).unwrap();
    assert_eq!(m.cache.stats().components.entries, 2);

    add(&m.store, "/configurations/site1/pages/news");
    m.store.flush_changes();
    assert!(m.driver.refresh() > 0);

    // site1's entry went with the pages tag; site2's survived.
    assert_eq!(m.cache.stats().components.entries, 1);
    let rebuilt = m.cache.load_components(&site1, None, false).unwrap();
    assert!(rebuilt.components.contains_key("pages/news"));
    let stats = m.cache.stats().components;
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.entries, 2);
}

#[test]
fn inherited_content_change_reaches_the_inheriting_root() {
    let m = model(|store| {
        add(store, "/configurations/site1");
        add(store, "/configurations/common");
        add(store, "/configurations/common/pages");
        add(store, "/configurations/common/pages/shared");
        store
            .set_property(
                &path("/configurations/site1"),
                INHERITS_FROM_PROPERTY,
                PropertyValue::Strings(vec!["../common".to_string()]),
            )
            .unwrap();
    });

    let site1 = path("/configurations/site1");
    let before = m.cache.load_components(&site1, None, false).unwrap();
    assert!(before.components.contains_key("pages/shared"));

    add(&m.store, "/configurations/common/pages/extra");
    m.store.flush_changes();
    m.driver.refresh();

    let after = m.cache.load_components(&site1, None, false).unwrap();
    assert!(after.components.contains_key("pages/extra"));
    // The rebuild was real, not a stale hit.
    assert_eq!(m.cache.stats().components.misses, 2);
}

#[test]
fn workspace_override_change_evicts_through_the_workspace_tag() {
    let m = model(|store| {
        add(store, "/configurations/site1");
        add(store, "/configurations/site1/pages");
        add(store, "/configurations/site1/pages/home");
        add(store, "/configurations/site1/workspace");
        add(store, "/configurations/site1/workspace/pages");
    });

    let site1 = path("/configurations/site1");
    m.cache.load_components(&site1, None, false).unwrap();

    add(&m.store, "/configurations/site1/workspace/pages/draft");
    m.store.flush_changes();
    m.driver.refresh();

    let after = m.cache.load_components(&site1, None, false).unwrap();
    assert!(after.components.contains_key("pages/draft"));
    assert!(after.components.contains_key("pages/home"));
}
