use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SiteModelError;

/// Stable per-node content identifier. Survives in-place property edits,
/// changes when a node is structurally replaced.
pub type NodeId = Uuid;

/// Normalized absolute path into the content store (`/a/b/c`, root is `/`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(String);

impl NodePath {
    pub fn root() -> Self {
        NodePath("/".to_string())
    }

    /// Parse and normalize an absolute path. Repeated separators are
    /// collapsed; `.` and `..` segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, SiteModelError> {
        if !raw.starts_with('/') {
            return Err(SiteModelError::InvalidPath(raw.to_string()));
        }
        let mut normalized = String::with_capacity(raw.len());
        for seg in raw.split('/') {
            if seg.is_empty() {
                continue;
            }
            if seg == "." || seg == ".." {
                return Err(SiteModelError::InvalidPath(raw.to_string()));
            }
            normalized.push('/');
            normalized.push_str(seg);
        }
        if normalized.is_empty() {
            normalized.push('/');
        }
        Ok(NodePath(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Last path segment; empty for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(NodePath::root()),
            Some(i) => Some(NodePath(self.0[..i].to_string())),
            None => None,
        }
    }

    /// Append a relative path (one or more segments, `/`-separated).
    pub fn join(&self, relative: &str) -> NodePath {
        let mut out = if self.is_root() {
            String::new()
        } else {
            self.0.clone()
        };
        for seg in relative.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(seg);
        }
        if out.is_empty() {
            out.push('/');
        }
        NodePath(out)
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &NodePath) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/')
    }

    /// Segments of `other` below `self`, or `None` when `other` is not at
    /// or below `self`.
    pub fn relative_segments<'a>(&self, other: &'a NodePath) -> Option<Vec<&'a str>> {
        if self == other {
            return Some(Vec::new());
        }
        if !self.is_ancestor_of(other) {
            return None;
        }
        let tail = if self.is_root() {
            &other.0[1..]
        } else {
            &other.0[self.0.len() + 1..]
        };
        Some(tail.split('/').collect())
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePath({})", self.0)
    }
}

impl FromStr for NodePath {
    type Err = SiteModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodePath::parse(s)
    }
}

/// Flat typed property value, as stored on a content node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Strings(Vec<String>),
    Long(i64),
    Double(f64),
    Bool(bool),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            PropertyValue::Strings(v) => Some(v),
            PropertyValue::String(_) => None,
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            PropertyValue::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// Kind of a raw change notification from the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
    PropertyChanged,
}

/// One raw, best-effort notification from the content store.
///
/// For `PropertyChanged` the path is the path of the property itself; the
/// collector coarsens it to the owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChange {
    pub path: NodePath,
    pub kind: ChangeKind,
    /// Set by origins the model explicitly ignores (e.g. its own writes).
    pub ignorable: bool,
}

impl RawChange {
    pub fn new(path: NodePath, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            ignorable: false,
        }
    }
}

/// Deduplicated, coarse model event produced by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelEvent {
    pub path: NodePath,
    pub property: bool,
}

impl ModelEvent {
    pub fn structural(path: NodePath) -> Self {
        Self {
            path,
            property: false,
        }
    }

    pub fn property(path: NodePath) -> Self {
        Self {
            path,
            property: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_separators() {
        let p = NodePath::parse("//configurations///site1/").unwrap();
        assert_eq!(p.as_str(), "/configurations/site1");
        assert_eq!(NodePath::parse("/").unwrap().as_str(), "/");
    }

    #[test]
    fn parse_rejects_relative_and_dotted() {
        assert!(NodePath::parse("configurations").is_err());
        assert!(NodePath::parse("/a/../b").is_err());
        assert!(NodePath::parse("/a/./b").is_err());
    }

    #[test]
    fn parent_and_name() {
        let p = NodePath::parse("/a/b/c").unwrap();
        assert_eq!(p.name(), "c");
        assert_eq!(p.parent().unwrap().as_str(), "/a/b");
        assert_eq!(NodePath::parse("/a").unwrap().parent().unwrap().as_str(), "/");
        assert!(NodePath::root().parent().is_none());
    }

    #[test]
    fn join_and_relative_segments() {
        let root = NodePath::parse("/configurations/site1").unwrap();
        let ws = root.join("workspace/pages");
        assert_eq!(ws.as_str(), "/configurations/site1/workspace/pages");
        assert_eq!(
            root.relative_segments(&ws).unwrap(),
            vec!["workspace", "pages"]
        );
        assert!(root.relative_segments(&NodePath::parse("/other").unwrap()).is_none());
        assert_eq!(root.relative_segments(&root).unwrap().len(), 0);
    }

    #[test]
    fn ancestry_is_segment_aware() {
        let a = NodePath::parse("/a/b").unwrap();
        assert!(a.is_ancestor_of(&NodePath::parse("/a/b/c").unwrap()));
        assert!(!a.is_ancestor_of(&NodePath::parse("/a/bc").unwrap()));
        assert!(!a.is_ancestor_of(&a));
        assert!(NodePath::root().is_ancestor_of(&a));
    }
}
