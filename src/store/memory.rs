//! In-Memory Object Store
//!
//! Versioned, watchable store used for standalone mode and tests. Every
//! kind shares one revision counter, so resource versions are totally
//! ordered across volumes, claims and classes like a real API server.

use crate::domain::{ObjectKey, ObjectList, Resource, ResourceStore, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

// =============================================================================
// Memory Store Configuration
// =============================================================================

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Events kept for watch replay; older versions answer `Expired`
    pub history_size: usize,
    /// Live event buffer per watcher before it is considered lagged
    pub watch_buffer: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history_size: 4096,
            watch_buffer: 4096,
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

type Revisioned<K> = (u64, WatchEvent<K>);

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    history: VecDeque<Revisioned<K>>,
    /// Highest revision dropped from history
    compacted: u64,
}

/// In-memory implementation of [`ResourceStore`]
pub struct MemoryStore<K: Resource> {
    inner: Mutex<Inner<K>>,
    revision: Arc<AtomicU64>,
    events: broadcast::Sender<Revisioned<K>>,
    config: MemoryStoreConfig,
}

impl<K: Resource> MemoryStore<K> {
    /// Store with its own revision counter
    pub fn new() -> Self {
        Self::with_revision(Arc::new(AtomicU64::new(0)), MemoryStoreConfig::default())
    }

    /// Store sharing a revision counter with sibling kinds
    pub fn with_revision(revision: Arc<AtomicU64>, config: MemoryStoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.watch_buffer.max(1));
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                history: VecDeque::with_capacity(config.history_size),
                compacted: 0,
            }),
            revision,
            events,
            config,
        }
    }

    /// Current store revision
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record an event; caller holds the lock
    fn publish(&self, inner: &mut Inner<K>, rev: u64, event: WatchEvent<K>) {
        if self.config.history_size > 0 {
            if inner.history.len() == self.config.history_size {
                if let Some((old, _)) = inner.history.pop_front() {
                    inner.compacted = old;
                }
            }
            inner.history.push_back((rev, event.clone()));
        } else {
            inner.compacted = rev;
        }
        // No receivers is fine
        let _ = self.events.send((rev, event));
    }

    /// Compare-and-swap write shared by both update paths
    ///
    /// `build` receives the stored object and returns its replacement. The
    /// version check and the write happen under one lock.
    fn write_with<F>(&self, incoming: &K, build: F) -> Result<K>
    where
        F: FnOnce(&K) -> K,
    {
        let key = incoming.key();
        let mut inner = self.inner.lock();
        let stored = inner
            .objects
            .get(&key)
            .ok_or_else(|| Error::not_found(K::KIND, key.to_string()))?;

        let expected = incoming.resource_version();
        if !expected.is_empty() && expected != stored.resource_version() {
            return Err(Error::conflict(K::KIND, key.to_string()));
        }

        let mut next = build(stored);
        // Unchanged objects keep their version and emit nothing
        if &next == stored {
            return Ok(next);
        }

        let rev = self.next_revision();
        next.meta_mut().resource_version = rev.to_string();
        inner.objects.insert(key, next.clone());
        self.publish(&mut inner, rev, WatchEvent::Modified(next.clone()));
        trace!(kind = K::KIND, key = %next.key(), rev, "object modified");
        Ok(next)
    }
}

impl<K: Resource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: Resource> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.inner.lock().objects.get(key).cloned())
    }

    async fn list(&self) -> Result<ObjectList<K>> {
        let inner = self.inner.lock();
        Ok(ObjectList {
            items: inner.objects.values().cloned().collect(),
            resource_version: self.revision().to_string(),
        })
    }

    /// Persists the status it is given, so fixtures can seed existing state
    async fn create(&self, mut object: K) -> Result<K> {
        let key = object.key();
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: K::KIND.to_string(),
                name: key.to_string(),
            });
        }

        let rev = self.next_revision();
        let meta = object.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = format!("{}-{:08}", K::KIND.to_lowercase(), rev);
        }
        meta.resource_version = rev.to_string();
        meta.creation_timestamp = Some(Utc::now());

        inner.objects.insert(key, object.clone());
        self.publish(&mut inner, rev, WatchEvent::Added(object.clone()));
        trace!(kind = K::KIND, key = %object.key(), rev, "object added");
        Ok(object)
    }

    async fn update(&self, object: K) -> Result<K> {
        self.write_with(&object, |stored| {
            let mut next = object.clone();
            next.copy_status_from(stored);
            let meta = next.meta_mut();
            meta.uid = stored.meta().uid.clone();
            meta.creation_timestamp = stored.meta().creation_timestamp;
            meta.resource_version = stored.resource_version().to_string();
            next
        })
    }

    async fn update_status(&self, object: K) -> Result<K> {
        self.write_with(&object, |stored| {
            let mut next = stored.clone();
            next.copy_status_from(&object);
            next
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut removed = inner
            .objects
            .remove(key)
            .ok_or_else(|| Error::not_found(K::KIND, key.to_string()))?;

        let rev = self.next_revision();
        removed.meta_mut().resource_version = rev.to_string();
        self.publish(&mut inner, rev, WatchEvent::Deleted(removed));
        trace!(kind = K::KIND, key = %key, rev, "object deleted");
        Ok(())
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let since = if resource_version.is_empty() {
            self.revision()
        } else {
            resource_version.parse::<u64>().map_err(|_| Error::Expired {
                kind: K::KIND.to_string(),
                version: resource_version.to_string(),
            })?
        };

        // Subscribe under the lock so nothing slips between replay and live
        let inner = self.inner.lock();
        if since < inner.compacted {
            return Err(Error::Expired {
                kind: K::KIND.to_string(),
                version: resource_version.to_string(),
            });
        }
        let rx = self.events.subscribe();
        let replay: Vec<Result<WatchEvent<K>>> = inner
            .history
            .iter()
            .filter(|(rev, _)| *rev > since)
            .map(|(_, event)| Ok(event.clone()))
            .collect();
        drop(inner);

        let version = resource_version.to_string();
        let live = stream::unfold(Some(rx), move |state| {
            let version = version.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Ok((rev, event)) if rev > since => return Some((Ok(event), Some(rx))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let err = Error::Expired {
                                kind: K::KIND.to_string(),
                                version,
                            };
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(replay).chain(live).boxed())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccessMode, ReclaimPolicy, Volume, VolumePhase};
    use assert_matches::assert_matches;

    fn volume(name: &str) -> Volume {
        Volume::new(name, 10, [AccessMode::ReadWriteOnce], ReclaimPolicy::Retain)
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::<Volume>::new();
        let created = store.create(volume("pv-1")).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.resource_version, "1");
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.create(volume("pv-1")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = MemoryStore::<Volume>::new();
        let created = store.create(volume("pv-1")).await.unwrap();

        let mut first = created.clone();
        first.metadata.labels.insert("a".into(), "1".into());
        let updated = store.update(first).await.unwrap();
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);

        // Stale version loses
        let mut stale = created.clone();
        stale.metadata.labels.insert("b".into(), "2".into());
        let err = store.update(stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_status_and_main_paths_are_separate() {
        let store = MemoryStore::<Volume>::new();
        let created = store.create(volume("pv-1")).await.unwrap();

        let mut status = created.clone();
        status.status.phase = VolumePhase::Available;
        status.spec.capacity = 999;
        let after_status = store.update_status(status).await.unwrap();
        assert_eq!(after_status.phase(), VolumePhase::Available);
        assert_eq!(after_status.spec.capacity, 10);

        let mut main = after_status.clone();
        main.status.phase = VolumePhase::Failed;
        main.spec.capacity = 20;
        let after_main = store.update(main).await.unwrap();
        assert_eq!(after_main.phase(), VolumePhase::Available);
        assert_eq!(after_main.spec.capacity, 20);
    }

    #[tokio::test]
    async fn test_noop_update_keeps_version() {
        let store = MemoryStore::<Volume>::new();
        let created = store.create(volume("pv-1")).await.unwrap();
        let same = store.update(created.clone()).await.unwrap();
        assert_eq!(same.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_watch_replays_then_follows() {
        let store = MemoryStore::<Volume>::new();
        let listed = store.list().await.unwrap();
        store.create(volume("pv-1")).await.unwrap();

        let mut watch = store.watch(&listed.resource_version).await.unwrap();
        store.delete(&ObjectKey::cluster("pv-1")).await.unwrap();

        assert_matches!(watch.next().await, Some(Ok(WatchEvent::Added(v))) if v.name() == "pv-1");
        assert_matches!(watch.next().await, Some(Ok(WatchEvent::Deleted(v))) if v.name() == "pv-1");
    }

    #[tokio::test]
    async fn test_watch_from_compacted_version_expires() {
        let store = MemoryStore::<Volume>::with_revision(
            Arc::new(AtomicU64::new(0)),
            MemoryStoreConfig {
                history_size: 2,
                watch_buffer: 16,
            },
        );
        for i in 0..5 {
            store.create(volume(&format!("pv-{}", i))).await.unwrap();
        }
        let err = store.watch("1").await.err().unwrap();
        assert_matches!(err, Error::Expired { .. });
        assert!(store.watch("4").await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_revision_orders_kinds() {
        use crate::domain::Claim;

        let revision = Arc::new(AtomicU64::new(0));
        let volumes = MemoryStore::<Volume>::with_revision(revision.clone(), Default::default());
        let claims = MemoryStore::<Claim>::with_revision(revision, Default::default());

        let v = volumes.create(volume("pv-1")).await.unwrap();
        let c = claims
            .create(Claim::new("ns", "c", 1, [AccessMode::ReadWriteOnce]))
            .await
            .unwrap();
        assert_eq!(v.metadata.resource_version, "1");
        assert_eq!(c.metadata.resource_version, "2");
    }
}
