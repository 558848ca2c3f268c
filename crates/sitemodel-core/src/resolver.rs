use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::error::{Result, SiteModelError};
use crate::snapshot::{NodeRef, TreeReader};
use crate::types::{NodeId, NodePath, PropertyValue};

/// Child name of the author-editable override area beneath a
/// configuration root.
pub const WORKSPACE_NODE_NAME: &str = "workspace";
/// Multi-valued property holding ordered `../name[/relpath]` references.
pub const INHERITS_FROM_PROPERTY: &str = "inheritsfrom";
/// Name of the implicit fallback configuration, always consulted last.
pub const DEFAULT_CONFIGURATION_NAME: &str = "default";

/// What an inheritance reference resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKind {
    ConfigurationRoot,
    Workspace,
    WorkspaceChild,
}

struct ChainEntry<'a> {
    node: NodeRef<'a>,
    kind: TargetKind,
}

impl<'a> ChainEntry<'a> {
    /// The node contributing children for one requested relative path, if
    /// this entry covers it.
    fn contributor_for(&self, relative_path: &str) -> Option<NodeRef<'a>> {
        match self.kind {
            TargetKind::ConfigurationRoot => self.node.node(relative_path),
            TargetKind::Workspace => self.node.node(relative_path),
            TargetKind::WorkspaceChild => {
                let mut segments = relative_path.split('/').filter(|s| !s.is_empty());
                let first = segments.next()?;
                if first != self.node.name() {
                    return None;
                }
                let rest: Vec<&str> = segments.collect();
                if rest.is_empty() {
                    Some(self.node)
                } else {
                    self.node.node(&rest.join("/"))
                }
            }
        }
    }
}

/// One merged view of a requested relative path: the main node (direct or
/// workspace-qualified) plus children merged under the fixed precedence
/// direct > workspace > inherited.
pub struct CompositeNode<'a> {
    pub relative_path: String,
    pub main: Option<NodeRef<'a>>,
    /// Merged child map; insertion order is merge order.
    pub children: Vec<(String, NodeRef<'a>)>,
}

impl<'a> CompositeNode<'a> {
    pub fn child(&self, name: &str) -> Option<NodeRef<'a>> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| *node)
    }
}

/// Identity-based cache key: the content identifiers of every composite
/// main node, every merged child (in insertion order), and the
/// configuration root itself. Equal keys mean equal resolved content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeCacheKey(Vec<NodeId>);

impl CompositeCacheKey {
    pub fn ids(&self) -> &[NodeId] {
        &self.0
    }
}

/// Resolves the ordered multi-root inheritance chain for one configuration
/// root and a set of requested relative paths. Constructed per request;
/// stateless with respect to any cache.
pub struct InheritanceResolver<'a> {
    root: NodeRef<'a>,
    relative_paths: Vec<String>,
    chain: Vec<ChainEntry<'a>>,
    dependency_paths: BTreeSet<NodePath>,
}

impl<'a> InheritanceResolver<'a> {
    pub fn new(
        reader: &TreeReader<'a>,
        root_path: &NodePath,
        relative_paths: &[&str],
    ) -> Result<Self> {
        let root = reader
            .node_at(root_path)
            .ok_or_else(|| SiteModelError::NodeNotFound(root_path.clone()))?;
        let configurations_root = root_path
            .parent()
            .ok_or_else(|| SiteModelError::InvalidPath(root_path.to_string()))?;

        let mut resolver = Self {
            root,
            relative_paths: relative_paths.iter().map(|s| s.to_string()).collect(),
            chain: Vec::new(),
            dependency_paths: BTreeSet::new(),
        };

        // Direct dependency paths: the root itself plus the direct and
        // workspace-qualified form of every requested relative path.
        resolver.add_root_dependencies(root_path);

        // Explicit inheritance, depth-first with cascades.
        let mut seen: HashSet<(NodeId, String)> = HashSet::new();
        let declarations = inherits_from(root);
        for declaration in &declarations {
            resolver.resolve_reference(
                reader,
                &configurations_root,
                declaration,
                reference_suffix(declaration),
                &mut seen,
            );
        }

        // Implicit default root, always last; its dependency paths are
        // recorded unconditionally.
        let default_path = configurations_root.join(DEFAULT_CONFIGURATION_NAME);
        resolver.add_root_dependencies(&default_path);
        if default_path != *root_path {
            if let Some(default_node) = reader.node_at(&default_path) {
                let already = resolver
                    .chain
                    .iter()
                    .any(|e| e.node.id() == default_node.id());
                if !already {
                    resolver.chain.push(ChainEntry {
                        node: default_node,
                        kind: TargetKind::ConfigurationRoot,
                    });
                }
            }
        }

        Ok(resolver)
    }

    fn add_root_dependencies(&mut self, root_path: &NodePath) {
        self.dependency_paths.insert(root_path.clone());
        let rels = self.relative_paths.clone();
        for rel in &rels {
            self.dependency_paths.insert(root_path.join(rel));
            self.dependency_paths
                .insert(root_path.join(WORKSPACE_NODE_NAME).join(rel));
        }
    }

    /// Resolve one `../name[/relpath]` reference, then cascade into the
    /// owning root's own references whose relative suffix matches the
    /// original declaration's suffix.
    fn resolve_reference(
        &mut self,
        reader: &TreeReader<'a>,
        configurations_root: &NodePath,
        declaration: &str,
        original_suffix: &str,
        seen: &mut HashSet<(NodeId, String)>,
    ) {
        let relative = match declaration.strip_prefix("../") {
            Some(rest) if !rest.is_empty() => rest,
            _ => {
                warn!(declaration, "malformed inheritance reference, skipping");
                return;
            }
        };
        let target_path = configurations_root.join(relative);
        // Recorded regardless of resolution success, so a later fix of the
        // target is observable through tag eviction.
        self.dependency_paths.insert(target_path.clone());

        let kind = match classify_target(configurations_root, &target_path) {
            Some(kind) => kind,
            None => {
                warn!(
                    declaration,
                    target = %target_path,
                    "inheritance reference does not denote a configuration root, \
                     workspace or workspace child, skipping"
                );
                return;
            }
        };
        let node = match reader.node_at(&target_path) {
            Some(node) => node,
            None => {
                debug!(declaration, target = %target_path, "unresolvable inheritance reference");
                return;
            }
        };
        if !seen.insert((node.id(), declaration.to_string())) {
            debug!(declaration, "inheritance reference already in chain, cycle guard");
            return;
        }
        self.chain.push(ChainEntry { node, kind });

        // Cascade: further references declared by the owning configuration
        // root, filtered to the same relative suffix as the original.
        let owning_root_name = match configurations_root.relative_segments(&target_path) {
            Some(segments) if !segments.is_empty() => segments[0].to_string(),
            _ => return,
        };
        let owning_root_path = configurations_root.join(&owning_root_name);
        // Changes under any inherited root's contributing areas must reach
        // entries depending on this chain.
        self.add_root_dependencies(&owning_root_path);
        let owning_root = match reader.node_at(&owning_root_path) {
            Some(node) => node,
            None => return,
        };
        for cascaded in &inherits_from(owning_root) {
            // Cascaded targets stay observable even when skipped.
            if let Some(rest) = cascaded.strip_prefix("../") {
                if !rest.is_empty() {
                    self.dependency_paths.insert(configurations_root.join(rest));
                }
            }
            if reference_suffix(cascaded) != original_suffix {
                debug!(
                    declaration = cascaded,
                    expected = original_suffix,
                    "cascaded reference suffix mismatch, skipped for this chain"
                );
                continue;
            }
            self.resolve_reference(reader, configurations_root, cascaded, original_suffix, seen);
        }
    }

    /// Number of inherited roots in the chain, implicit default included.
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// Merge one composite node per requested relative path.
    pub fn composite_nodes(&self) -> Vec<CompositeNode<'a>> {
        let mut composites = Vec::with_capacity(self.relative_paths.len());
        for rel in &self.relative_paths {
            let workspace_rel = format!("{WORKSPACE_NODE_NAME}/{rel}");
            let direct = self.root.node(rel);
            let workspace = self.root.node(&workspace_rel);
            let main = direct.or(workspace);

            let mut children: Vec<(String, NodeRef<'a>)> = Vec::new();
            if let Some(node) = direct {
                for child in node.children() {
                    children.push((child.name().to_string(), child));
                }
            }
            // Workspace overrides from the requesting root only; a direct
            // child with the same name wins.
            if direct.is_some() {
                if let Some(ws) = workspace {
                    for child in ws.children() {
                        if children.iter().any(|(n, _)| n == child.name()) {
                            warn!(
                                name = child.name(),
                                path = %ws.path(),
                                "workspace child shadowed by direct child, keeping original"
                            );
                            continue;
                        }
                        children.push((child.name().to_string(), child));
                    }
                }
            } else if let Some(ws) = workspace {
                for child in ws.children() {
                    children.push((child.name().to_string(), child));
                }
            }

            // Inherited contributions fill names not already present;
            // first contributor to offer a name wins.
            for entry in &self.chain {
                if let Some(contributor) = entry.contributor_for(rel) {
                    for child in contributor.children() {
                        if children.iter().any(|(n, _)| n == child.name()) {
                            debug!(
                                name = child.name(),
                                contributor = %contributor.path(),
                                "inherited child already present, first contributor wins"
                            );
                            continue;
                        }
                        children.push((child.name().to_string(), child));
                    }
                }
            }

            if main.is_some() || !children.is_empty() {
                composites.push(CompositeNode {
                    relative_path: rel.clone(),
                    main,
                    children,
                });
            }
        }
        composites
    }

    /// Identity key over the resolved composites: main-node identifiers in
    /// request order, then every merged child identifier in insertion
    /// order, then the configuration root's own identifier. Stable across
    /// calls over an unchanged tree.
    pub fn cache_key(&self) -> CompositeCacheKey {
        let composites = self.composite_nodes();
        let mut ids = Vec::new();
        for composite in &composites {
            if let Some(main) = composite.main {
                ids.push(main.id());
            }
        }
        for composite in &composites {
            for (_, child) in &composite.children {
                ids.push(child.id());
            }
        }
        ids.push(self.root.id());
        CompositeCacheKey(ids)
    }

    /// Union of every path recorded while building the chain, consumed by
    /// tag-based cache invalidation.
    pub fn dependency_paths(&self) -> &BTreeSet<NodePath> {
        &self.dependency_paths
    }
}

/// Ordered inheritance declarations of a node; a single string property is
/// accepted as a one-element list.
fn inherits_from(node: NodeRef<'_>) -> Vec<String> {
    match node.property(INHERITS_FROM_PROPERTY) {
        Some(PropertyValue::Strings(values)) => values.clone(),
        Some(PropertyValue::String(value)) => vec![value.clone()],
        _ => Vec::new(),
    }
}

/// Relative suffix of a declaration: the part after `../name`, empty for a
/// plain configuration reference.
fn reference_suffix(declaration: &str) -> &str {
    let rest = declaration.strip_prefix("../").unwrap_or(declaration);
    match rest.find('/') {
        Some(i) => &rest[i + 1..],
        None => "",
    }
}

/// A reference target must be a configuration root, a workspace node, or a
/// direct child of a workspace node.
fn classify_target(configurations_root: &NodePath, target: &NodePath) -> Option<TargetKind> {
    let segments = configurations_root.relative_segments(target)?;
    match segments.as_slice() {
        [_] => Some(TargetKind::ConfigurationRoot),
        [_, ws] if *ws == WORKSPACE_NODE_NAME => Some(TargetKind::Workspace),
        [_, ws, _] if *ws == WORKSPACE_NODE_NAME => Some(TargetKind::WorkspaceChild),
        _ => None,
    }
}
