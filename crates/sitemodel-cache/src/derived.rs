use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sitemodel_core::{
    CompositeCacheKey, CompositeNode, InheritanceResolver, ModelEvent, NodeId, NodePath, NodeRef,
    NodeSnapshotTree, PropertyValue, Result, WORKSPACE_NODE_NAME,
};

use crate::tagged::{CacheStats, TaggedMemoCache};

/// Relative paths resolved per derived kind.
const CHANNEL_RELATIVE_PATHS: &[&str] = &["channel"];
const COMPONENTS_RELATIVE_PATHS: &[&str] = &["components", "pages", "templates"];
const HANDLER_RELATIVE_PATHS: &[&str] = &["handlers", "sitemap"];

/// Child name of the shared component catalog under the configurations
/// root. Component configurations reference it regardless of which root
/// they belong to, so every components entry carries its path as a tag.
pub const CATALOG_NODE_NAME: &str = "catalog";

const PARAMETER_NAMES_PROPERTY: &str = "parameternames";
const PARAMETER_VALUES_PROPERTY: &str = "parametervalues";

/// Immutable description of one channel, derived from a root's `channel`
/// composite node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: NodeId,
    pub name: String,
    pub title: Option<String>,
    pub channel_type: Option<String>,
    pub locale: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// One component in a resolved components configuration. Parameters come
/// from the paired `parameternames`/`parametervalues` properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    pub id: NodeId,
    pub name: String,
    pub kind: String,
    pub path: NodePath,
    pub template: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub children: Vec<ComponentDefinition>,
}

/// Fully merged component tree for one configuration root, keyed by
/// `<relative-path>/<name>`. Externally mutable, so cache hits hand out a
/// deep copy rather than the stored entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentsConfiguration {
    pub components: BTreeMap<String, ComponentDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDefinition {
    pub id: NodeId,
    pub name: String,
    pub kind: String,
    pub path: NodePath,
    pub pipeline: Option<String>,
}

/// Resolved request-handling configuration: handler and sitemap entries in
/// merge order per relative path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfiguration {
    pub handlers: Vec<HandlerDefinition>,
}

/// Cache key: the resolver's identity key extended with discriminators the
/// resolver cannot see.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtendedCacheKey {
    pub composite: CompositeCacheKey,
    pub mount: Option<NodeId>,
    pub preview: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DerivedCacheStats {
    pub channels: CacheStats,
    pub components: CacheStats,
    pub handlers: CacheStats,
}

struct Caches {
    channels: TaggedMemoCache<ExtendedCacheKey, ChannelDescriptor>,
    components: TaggedMemoCache<ExtendedCacheKey, ComponentsConfiguration>,
    handlers: TaggedMemoCache<ExtendedCacheKey, HandlerConfiguration>,
}

impl Caches {
    fn new(capacity: usize) -> Self {
        Self {
            channels: TaggedMemoCache::new(capacity),
            components: TaggedMemoCache::new(capacity),
            handlers: TaggedMemoCache::new(capacity),
        }
    }
}

/// Memoization layer for expensive derived objects, one tagged cache per
/// kind. Load calls resolve inheritance against the snapshot tree on the
/// calling thread; a single coarse lock serializes every public operation
/// so the two cache tiers stay mutually consistent.
///
/// Lock order is always derived cache first, snapshot tree second.
pub struct DerivedModelCache {
    tree: Arc<NodeSnapshotTree>,
    configurations_root: NodePath,
    catalog_path: NodePath,
    inner: Mutex<Caches>,
}

impl DerivedModelCache {
    pub fn new(tree: Arc<NodeSnapshotTree>, capacity: usize) -> Self {
        let configurations_root = tree.root_path().clone();
        let catalog_path = configurations_root.join(CATALOG_NODE_NAME);
        Self {
            tree,
            configurations_root,
            catalog_path,
            inner: Mutex::new(Caches::new(capacity)),
        }
    }

    /// Channel descriptor for one configuration root. Immutable value, so
    /// hits return the shared entry by clone without further ceremony.
    pub fn load_channel(
        &self,
        root_path: &NodePath,
        mount: Option<NodeId>,
        preview: bool,
    ) -> Result<ChannelDescriptor> {
        let mut caches = self.inner.lock();
        self.tree.read(|reader| {
            let resolver = InheritanceResolver::new(&reader, root_path, CHANNEL_RELATIVE_PATHS)?;
            let key = ExtendedCacheKey {
                composite: resolver.cache_key(),
                mount,
                preview,
            };
            if let Some(hit) = caches.channels.get(&key) {
                return Ok(hit);
            }
            let root = reader
                .node_at(root_path)
                .ok_or_else(|| sitemodel_core::SiteModelError::NodeNotFound(root_path.clone()))?;
            let value = build_channel(root, &resolver.composite_nodes());
            debug!(root = %root_path, channel = %value.name, "built channel descriptor");
            caches
                .channels
                .put(key, value.clone(), resolver.dependency_paths().iter().cloned());
            Ok(value)
        })
    }

    /// Components configuration for one configuration root. The value is
    /// externally mutable; both the stored entry and every hit are
    /// independent deep copies.
    pub fn load_components(
        &self,
        root_path: &NodePath,
        mount: Option<NodeId>,
        preview: bool,
    ) -> Result<ComponentsConfiguration> {
        let mut caches = self.inner.lock();
        let catalog_path = self.catalog_path.clone();
        self.tree.read(|reader| {
            let resolver = InheritanceResolver::new(&reader, root_path, COMPONENTS_RELATIVE_PATHS)?;
            let key = ExtendedCacheKey {
                composite: resolver.cache_key(),
                mount,
                preview,
            };
            if let Some(hit) = caches.components.get(&key) {
                return Ok(hit);
            }
            let value = build_components(&resolver.composite_nodes());
            debug!(
                root = %root_path,
                components = value.components.len(),
                "built components configuration"
            );
            let tags = resolver
                .dependency_paths()
                .iter()
                .cloned()
                .chain(std::iter::once(catalog_path));
            caches.components.put(key, value.clone(), tags);
            Ok(value)
        })
    }

    /// Handler and sitemap configuration for one configuration root.
    pub fn load_handlers(
        &self,
        root_path: &NodePath,
        mount: Option<NodeId>,
        preview: bool,
    ) -> Result<HandlerConfiguration> {
        let mut caches = self.inner.lock();
        self.tree.read(|reader| {
            let resolver = InheritanceResolver::new(&reader, root_path, HANDLER_RELATIVE_PATHS)?;
            let key = ExtendedCacheKey {
                composite: resolver.cache_key(),
                mount,
                preview,
            };
            if let Some(hit) = caches.handlers.get(&key) {
                return Ok(hit);
            }
            let value = build_handlers(&resolver.composite_nodes());
            debug!(root = %root_path, handlers = value.handlers.len(), "built handler configuration");
            caches
                .handlers
                .put(key, value.clone(), resolver.dependency_paths().iter().cloned());
            Ok(value)
        })
    }

    /// Coarsest path that should drive eviction for one event path, or
    /// `None` for paths outside the configurations area.
    ///
    /// Everything at or below the shared catalog collapses onto the
    /// catalog path itself; a deep path below a workspace-override area
    /// collapses onto the workspace main node; any other deep path
    /// collapses onto its first two segments below the configurations
    /// root.
    pub fn eviction_tag(&self, event_path: &NodePath) -> Option<NodePath> {
        if *event_path == self.catalog_path || self.catalog_path.is_ancestor_of(event_path) {
            return Some(self.catalog_path.clone());
        }
        let segments = self.configurations_root.relative_segments(event_path)?;
        match segments.as_slice() {
            [] => None,
            [_] => Some(event_path.clone()),
            [root, ws, main, ..] if *ws == WORKSPACE_NODE_NAME => Some(
                self.configurations_root
                    .join(root)
                    .join(WORKSPACE_NODE_NAME)
                    .join(main),
            ),
            [root, main, ..] => Some(self.configurations_root.join(root).join(main)),
        }
    }

    /// Evict every entry tagged with a path any of `events` collapses to.
    /// Tags are deduplicated across the batch first.
    pub fn handle_events<'a, I>(&self, events: I)
    where
        I: IntoIterator<Item = &'a ModelEvent>,
    {
        let mut tags: Vec<NodePath> = Vec::new();
        for event in events {
            if let Some(tag) = self.eviction_tag(&event.path) {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        if tags.is_empty() {
            return;
        }
        let mut caches = self.inner.lock();
        let mut removed = 0;
        for tag in &tags {
            removed += caches.channels.evict_keys_by_tag(tag);
            removed += caches.components.evict_keys_by_tag(tag);
            removed += caches.handlers.evict_keys_by_tag(tag);
        }
        if removed > 0 {
            info!(tags = tags.len(), removed, "evicted derived cache entries");
        }
    }

    /// Empty every per-kind cache. Used on full model reload.
    pub fn clear(&self) {
        let mut caches = self.inner.lock();
        caches.channels.clear();
        caches.components.clear();
        caches.handlers.clear();
        info!("cleared derived model caches");
    }

    pub fn stats(&self) -> DerivedCacheStats {
        let caches = self.inner.lock();
        DerivedCacheStats {
            channels: caches.channels.stats(),
            components: caches.components.stats(),
            handlers: caches.handlers.stats(),
        }
    }
}

fn build_channel(root: NodeRef<'_>, composites: &[CompositeNode<'_>]) -> ChannelDescriptor {
    let main = composites
        .iter()
        .find(|c| c.relative_path == CHANNEL_RELATIVE_PATHS[0])
        .and_then(|c| c.main);
    match main {
        Some(channel) => ChannelDescriptor {
            id: channel.id(),
            name: root.name().to_string(),
            title: string_property(channel, "title"),
            channel_type: string_property(channel, "type"),
            locale: string_property(channel, "locale"),
            properties: channel.properties().clone(),
        },
        // Roots without a channel node still present themselves under
        // their display name.
        None => ChannelDescriptor {
            id: root.id(),
            name: root.name().to_string(),
            title: Some(root.display_name().to_string()),
            channel_type: None,
            locale: None,
            properties: BTreeMap::new(),
        },
    }
}

fn build_components(composites: &[CompositeNode<'_>]) -> ComponentsConfiguration {
    let mut components = BTreeMap::new();
    for composite in composites {
        for (name, node) in &composite.children {
            components.insert(
                format!("{}/{}", composite.relative_path, name),
                component_definition(*node),
            );
        }
    }
    ComponentsConfiguration { components }
}

fn component_definition(node: NodeRef<'_>) -> ComponentDefinition {
    ComponentDefinition {
        id: node.id(),
        name: node.name().to_string(),
        kind: node.kind().to_string(),
        path: node.path().clone(),
        template: string_property(node, "template"),
        parameters: paired_parameters(node),
        children: node.children().map(component_definition).collect(),
    }
}

fn build_handlers(composites: &[CompositeNode<'_>]) -> HandlerConfiguration {
    let mut handlers = Vec::new();
    for composite in composites {
        for (_, node) in &composite.children {
            handlers.push(HandlerDefinition {
                id: node.id(),
                name: node.name().to_string(),
                kind: node.kind().to_string(),
                path: node.path().clone(),
                pipeline: string_property(*node, "pipeline"),
            });
        }
    }
    HandlerConfiguration { handlers }
}

fn string_property(node: NodeRef<'_>, name: &str) -> Option<String> {
    node.property(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Zip the paired parameter-name/parameter-value properties; a length
/// mismatch truncates to the shorter list.
fn paired_parameters(node: NodeRef<'_>) -> BTreeMap<String, String> {
    let names = match node.property(PARAMETER_NAMES_PROPERTY) {
        Some(PropertyValue::Strings(names)) => names,
        _ => return BTreeMap::new(),
    };
    let values = match node.property(PARAMETER_VALUES_PROPERTY) {
        Some(PropertyValue::Strings(values)) => values,
        _ => return BTreeMap::new(),
    };
    names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| (n.clone(), v.clone()))
        .collect()
}
