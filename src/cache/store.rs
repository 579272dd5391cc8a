//! Object Cache
//!
//! Local indexed copy of one object kind, fed by the informer's watch
//! stream and by the binder's own writes. Lock-free reads via DashMap.

use crate::domain::{ObjectKey, Resource};
use dashmap::DashMap;
use std::collections::HashSet;

/// Outcome of offering an object to the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate<K> {
    /// First time this key is seen
    Inserted,
    /// Replaced an older version; carries the previous object
    Replaced(K),
    /// Incoming object was not newer than the cached one
    Stale,
}

/// Compare two resource versions
///
/// Versions are decimal revisions from the store. Anything unparsable is
/// treated as newer so that an opaque token never wedges the cache.
fn is_newer(incoming: &str, cached: &str) -> bool {
    match (incoming.parse::<u64>(), cached.parse::<u64>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => incoming != cached,
    }
}

/// Concurrent cache of one resource kind keyed by [`ObjectKey`]
pub struct ObjectCache<K: Resource> {
    objects: DashMap<ObjectKey, K>,
}

impl<K: Resource> ObjectCache<K> {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<K> {
        self.objects.get(key).map(|e| e.value().clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<K> {
        self.get(&ObjectKey::cluster(name))
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    /// Snapshot of every cached object
    pub fn list(&self) -> Vec<K> {
        self.objects.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot of cached objects passing `filter`
    pub fn list_filtered<F>(&self, filter: F) -> Vec<K>
    where
        F: Fn(&K) -> bool,
    {
        self.objects
            .iter()
            .filter(|e| filter(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Store `object` unless the cache already holds the same or a newer version
    pub fn store_if_newer(&self, object: K) -> CacheUpdate<K> {
        use dashmap::mapref::entry::Entry;

        match self.objects.entry(object.key()) {
            Entry::Vacant(slot) => {
                slot.insert(object);
                CacheUpdate::Inserted
            }
            Entry::Occupied(mut slot) => {
                if is_newer(object.resource_version(), slot.get().resource_version()) {
                    CacheUpdate::Replaced(slot.insert(object))
                } else {
                    CacheUpdate::Stale
                }
            }
        }
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        self.objects.remove(key).map(|(_, v)| v)
    }

    /// Drop every object whose key is not in `keep`
    ///
    /// Used after a relist; returns the dropped objects so the caller can
    /// emit deletes.
    pub fn retain_only(&self, keep: &HashSet<ObjectKey>) -> Vec<K> {
        let gone: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|e| !keep.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        gone.iter().filter_map(|k| self.remove(k)).collect()
    }
}

impl<K: Resource> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccessMode, ReclaimPolicy, Volume};
    use assert_matches::assert_matches;

    fn volume(name: &str, rv: &str) -> Volume {
        let mut v = Volume::new(name, 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Retain);
        v.metadata.resource_version = rv.to_string();
        v
    }

    #[test]
    fn test_store_if_newer_rejects_stale() {
        let cache = ObjectCache::new();
        assert_matches!(cache.store_if_newer(volume("pv", "5")), CacheUpdate::Inserted);
        assert_matches!(cache.store_if_newer(volume("pv", "4")), CacheUpdate::Stale);
        assert_matches!(cache.store_if_newer(volume("pv", "5")), CacheUpdate::Stale);
        assert_matches!(
            cache.store_if_newer(volume("pv", "10")),
            CacheUpdate::Replaced(old) if old.metadata.resource_version == "5"
        );
        assert_eq!(cache.get_by_name("pv").unwrap().metadata.resource_version, "10");
    }

    #[test]
    fn test_retain_only_reports_removed() {
        let cache = ObjectCache::new();
        cache.store_if_newer(volume("a", "1"));
        cache.store_if_newer(volume("b", "2"));

        let keep = HashSet::from([ObjectKey::cluster("b"), ObjectKey::cluster("c")]);
        let removed = cache.retain_only(&keep);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].metadata.name, "a");
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(&ObjectKey::cluster("a")));
    }

    #[test]
    fn test_list_filtered() {
        let cache = ObjectCache::new();
        cache.store_if_newer(volume("a", "1"));
        cache.store_if_newer(volume("b", "2"));
        let only_b = cache.list_filtered(|v| v.metadata.name == "b");
        assert_eq!(only_b.len(), 1);
    }
}
