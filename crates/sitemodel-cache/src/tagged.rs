use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use tracing::debug;

use sitemodel_core::NodePath;

/// Cache traffic counters, cheap to copy out for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

struct Entry<V> {
    value: V,
    tags: BTreeSet<NodePath>,
}

/// Best-effort memoization map whose entries carry dependency-path tags
/// for coarse eviction.
///
/// There is no TTL; entries leave either through `evict_keys_by_tag`,
/// `clear`, or capacity pressure (oldest first). A `get` miss is always a
/// legal outcome. Callers provide their own locking; the derived-model
/// cache serializes all access under one coarse lock.
pub struct TaggedMemoCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    by_tag: HashMap<NodePath, HashSet<K>>,
    order: VecDeque<K>,
    capacity: usize,
    stats: CacheStats,
}

impl<K, V> TaggedMemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_tag: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            stats: CacheStats::default(),
        }
    }

    pub fn put(&mut self, key: K, value: V, tags: impl IntoIterator<Item = NodePath>) {
        self.remove(&key);
        let tags: BTreeSet<NodePath> = tags.into_iter().collect();
        for tag in &tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.entries.insert(key.clone(), Entry { value, tags });
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.remove(&oldest) {
                        self.stats.evictions += 1;
                    }
                }
                None => break,
            }
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Remove every entry whose tag set contains `tag`. Returns the number
    /// of entries removed.
    pub fn evict_keys_by_tag(&mut self, tag: &NodePath) -> usize {
        let keys: Vec<K> = match self.by_tag.get(tag) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return 0,
        };
        let mut removed = 0;
        for key in keys {
            if self.remove(&key) {
                removed += 1;
            }
        }
        if removed > 0 {
            self.stats.evictions += removed as u64;
            debug!(tag = %tag, removed, "evicted tagged cache entries");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_tag.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }

    /// Detach `key` from the entry map, the tag index and the eviction
    /// order. Leaving the key in `order` would grow the queue by one dead
    /// handle per tag-eviction cycle, since the capacity loop only runs
    /// while the entry map is over capacity.
    fn remove(&mut self, key: &K) -> bool {
        let entry = match self.entries.remove(key) {
            Some(entry) => entry,
            None => return false,
        };
        for tag in &entry.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        self.order.retain(|k| k != key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    fn cache() -> TaggedMemoCache<String, String> {
        TaggedMemoCache::new(16)
    }

    #[test]
    fn put_get_roundtrip_and_stats() {
        let mut c = cache();
        c.put("k".to_string(), "v".to_string(), [tag("/a")]);
        assert_eq!(c.get(&"k".to_string()), Some("v".to_string()));
        assert_eq!(c.get(&"absent".to_string()), None);
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn tag_eviction_is_exact() {
        let mut c = cache();
        c.put("one".to_string(), "1".to_string(), [tag("/a"), tag("/shared")]);
        c.put("two".to_string(), "2".to_string(), [tag("/b"), tag("/shared")]);
        c.put("three".to_string(), "3".to_string(), [tag("/c")]);

        assert_eq!(c.evict_keys_by_tag(&tag("/shared")), 2);
        assert_eq!(c.get(&"one".to_string()), None);
        assert_eq!(c.get(&"two".to_string()), None);
        assert_eq!(c.get(&"three".to_string()), Some("3".to_string()));
        assert_eq!(c.evict_keys_by_tag(&tag("/shared")), 0);
    }

    #[test]
    fn overwrite_replaces_tags() {
        let mut c = cache();
        c.put("k".to_string(), "v1".to_string(), [tag("/old")]);
        c.put("k".to_string(), "v2".to_string(), [tag("/new")]);

        assert_eq!(c.evict_keys_by_tag(&tag("/old")), 0);
        assert_eq!(c.get(&"k".to_string()), Some("v2".to_string()));
        assert_eq!(c.evict_keys_by_tag(&tag("/new")), 1);
        assert!(c.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut c: TaggedMemoCache<u32, u32> = TaggedMemoCache::new(2);
        c.put(1, 1, [tag("/t")]);
        c.put(2, 2, [tag("/t")]);
        c.put(3, 3, [tag("/t")]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&1), None);
        assert_eq!(c.get(&2), Some(2));
        assert_eq!(c.get(&3), Some(3));
        assert!(c.stats().evictions >= 1);
    }

    #[test]
    fn repeated_put_evict_cycles_do_not_grow_the_order_queue() {
        let mut c = cache();
        for i in 0..100 {
            c.put(format!("k{i}"), "v".to_string(), [tag("/t")]);
            assert_eq!(c.evict_keys_by_tag(&tag("/t")), 1);
        }
        assert!(c.is_empty());
        assert_eq!(c.order.len(), 0);

        // Overwrites keep one order slot per live key.
        c.put("k".to_string(), "v1".to_string(), [tag("/t")]);
        c.put("k".to_string(), "v2".to_string(), [tag("/t")]);
        assert_eq!(c.order.len(), 1);
    }

    #[test]
    fn clear_empties_everything() {
        let mut c = cache();
        c.put("k".to_string(), "v".to_string(), [tag("/a")]);
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.evict_keys_by_tag(&tag("/a")), 0);
    }
}
