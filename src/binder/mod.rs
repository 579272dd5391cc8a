//! Binder
//!
//! Reconciliation core: the matching engine, the claim/volume state
//! machine, the provisioning trigger and the reclaim worker.
//!
//! Every mutation goes through the store's versioned write path and the
//! stored result is pushed back into the local cache, so the next decision
//! never sees the binder's own stale state. Work on one object is
//! serialized through [`KeyLocks`]; claim locks are always taken before
//! volume locks.

pub mod matcher;
pub mod provision;
pub mod reclaim;
pub mod registry;
pub mod sync;

pub use matcher::{find_match, is_candidate, satisfies};
pub use registry::PluginRegistry;

use crate::cache::{BinderEvent, BinderMetrics, Caches, KeyLocks, ObjectCache, WorkQueue, WorkQueueConfig};
use crate::config::ControllerConfig;
use crate::domain::{Claim, ClaimPhase, Resource, Volume, VolumePhase};
use crate::error::Result;
use crate::store::Stores;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

const EVENT_BUFFER: usize = 1024;

pub(crate) fn claim_lock(key: &str) -> String {
    format!("claim:{}", key)
}

pub(crate) fn volume_lock(name: &str) -> String {
    format!("volume:{}", name)
}

// =============================================================================
// Binder
// =============================================================================

/// Cloneable handle to the reconciliation core
#[derive(Clone)]
pub struct Binder {
    stores: Stores,
    caches: Caches,
    locks: Arc<KeyLocks>,
    plugins: Arc<PluginRegistry>,
    config: Arc<ControllerConfig>,
    events: broadcast::Sender<BinderEvent>,
    metrics: BinderMetrics,
    claim_queue: WorkQueue,
    volume_queue: WorkQueue,
    /// Provisioning and reclaim tasks; drained on shutdown
    tasks: TaskTracker,
    /// Claim UIDs with a provisioning call in flight
    provisioning: Arc<DashSet<String>>,
    /// Volumes with a reclaim in flight
    reclaiming: Arc<DashSet<String>>,
    /// Consecutive reclaim failures and the earliest next attempt
    reclaim_failures: Arc<DashMap<String, (u32, Instant)>>,
}

impl Binder {
    pub fn new(
        stores: Stores,
        caches: Caches,
        plugins: PluginRegistry,
        config: ControllerConfig,
        metrics: BinderMetrics,
    ) -> Self {
        let queue_config = WorkQueueConfig {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        };
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            stores,
            caches,
            locks: Arc::new(KeyLocks::new()),
            plugins: Arc::new(plugins),
            config: Arc::new(config),
            events,
            metrics,
            claim_queue: WorkQueue::new("claims", queue_config.clone()),
            volume_queue: WorkQueue::new("volumes", queue_config),
            tasks: TaskTracker::new(),
            provisioning: Arc::new(DashSet::new()),
            reclaiming: Arc::new(DashSet::new()),
            reclaim_failures: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BinderEvent> {
        self.events.subscribe()
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &BinderMetrics {
        &self.metrics
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn claim_queue(&self) -> &WorkQueue {
        &self.claim_queue
    }

    pub fn volume_queue(&self) -> &WorkQueue {
        &self.volume_queue
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub(crate) fn emit(&self, event: BinderEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Enqueue Helpers
    // =========================================================================

    /// Queue every claim still waiting for a volume
    pub fn enqueue_pending_claims(&self) {
        for claim in self
            .caches
            .claims
            .list_filtered(|c| c.is_unbound() && c.phase() == ClaimPhase::Pending)
        {
            self.claim_queue.add(claim.key().to_string());
        }
    }

    /// Queue pending claims whose class resolves to `class`
    pub fn enqueue_claims_for_class(&self, class: &str) {
        let default_class = self.config.default_class();
        for claim in self.caches.claims.list_filtered(|c| {
            c.is_unbound() && c.spec.storage_class.resolve(default_class) == class
        }) {
            self.claim_queue.add(claim.key().to_string());
        }
    }

    // =========================================================================
    // Versioned Writes
    // =========================================================================

    fn record<K: Resource>(&self, cache: &ObjectCache<K>, result: Result<K>) -> Result<K> {
        match result {
            Ok(stored) => {
                cache.store_if_newer(stored.clone());
                Ok(stored)
            }
            Err(e) => {
                if e.is_conflict() {
                    self.metrics.conflicts.with_label_values(&[K::KIND]).inc();
                    debug!(kind = K::KIND, error = %e, "optimistic write rejected");
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn update_volume(&self, volume: Volume) -> Result<Volume> {
        let result = self.stores.volumes.update(volume).await;
        self.record(&self.caches.volumes, result)
    }

    pub(crate) async fn update_volume_status(&self, volume: Volume) -> Result<Volume> {
        let result = self.stores.volumes.update_status(volume).await;
        self.record(&self.caches.volumes, result)
    }

    pub(crate) async fn update_claim(&self, claim: Claim) -> Result<Claim> {
        let result = self.stores.claims.update(claim).await;
        self.record(&self.caches.claims, result)
    }

    pub(crate) async fn update_claim_status(&self, claim: Claim) -> Result<Claim> {
        let result = self.stores.claims.update_status(claim).await;
        self.record(&self.caches.claims, result)
    }

    /// Move a volume to `phase`, writing only when something changes
    pub(crate) async fn set_volume_phase(
        &self,
        volume: Volume,
        phase: VolumePhase,
        message: Option<String>,
    ) -> Result<Volume> {
        if volume.status.phase == phase && volume.status.message == message {
            return Ok(volume);
        }
        let from = volume.phase();
        let mut updated = volume;
        updated.status.phase = phase;
        updated.status.message = message;
        let stored = self.update_volume_status(updated).await?;

        if from != phase {
            info!(volume = %stored.metadata.name, from = %from, to = %phase, "volume phase changed");
            self.metrics
                .phase_transitions
                .with_label_values(&[Volume::KIND, &phase.to_string()])
                .inc();
            if let Some(event) = BinderEvent::for_volume_phase(&stored) {
                self.emit(event);
            }
            if phase == VolumePhase::Available {
                match &stored.spec.claim_ref {
                    Some(claim_ref) => self.claim_queue.add(claim_ref.key().to_string()),
                    None => self.enqueue_pending_claims(),
                }
            }
        }
        Ok(stored)
    }

    /// Move a claim to `phase`; `Bound` records the volume's capacity and modes
    pub(crate) async fn set_claim_phase(
        &self,
        claim: Claim,
        phase: ClaimPhase,
        volume: Option<&Volume>,
    ) -> Result<Claim> {
        let mut status = claim.status.clone();
        status.phase = phase;
        match (phase, volume) {
            (ClaimPhase::Bound, Some(v)) => {
                status.capacity = Some(v.spec.capacity);
                status.access_modes = v.spec.access_modes.clone();
            }
            (ClaimPhase::Pending, _) => {
                status.capacity = None;
                status.access_modes.clear();
            }
            _ => {}
        }
        if status == claim.status {
            return Ok(claim);
        }

        let from = claim.phase();
        let mut updated = claim;
        updated.status = status;
        let stored = self.update_claim_status(updated).await?;

        if from != phase {
            info!(claim = %stored.key(), from = %from, to = %phase, "claim phase changed");
            self.metrics
                .phase_transitions
                .with_label_values(&[Claim::KIND, &phase.to_string()])
                .inc();
        }
        Ok(stored)
    }
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binder")
            .field("plugins", &self.plugins)
            .field("claims_queued", &self.claim_queue.len())
            .field("volumes_queued", &self.volume_queue.len())
            .finish()
    }
}

// =============================================================================
// Test Fixtures
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::domain::{
        ProvisionOptions, ProvisionedVolume, VolumePlugin, VolumeSource,
    };
    use crate::error::Error;
    use crate::store::MemoryStores;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable plugin recording every call
    #[derive(Default)]
    pub struct FakePlugin {
        pub fail_provision: AtomicBool,
        pub fail_delete: AtomicBool,
        pub fail_recycle: AtomicBool,
        pub not_ready: AtomicBool,
        pub provisioned: AtomicUsize,
        pub deleted: Mutex<Vec<String>>,
        pub recycled: Mutex<Vec<String>>,
    }

    pub const FAKE: &str = "fake";

    #[async_trait]
    impl VolumePlugin for FakePlugin {
        fn name(&self) -> &str {
            FAKE
        }

        fn supports(&self, source: &VolumeSource) -> bool {
            matches!(source, VolumeSource::External { driver, .. } if driver == FAKE)
        }

        async fn provision(&self, options: &ProvisionOptions) -> Result<ProvisionedVolume> {
            if self.fail_provision.load(Ordering::SeqCst) {
                return Err(Error::ProvisioningFailed {
                    claim: options.claim.clone(),
                    reason: "backend out of space".into(),
                });
            }
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionedVolume {
                source: VolumeSource::External {
                    driver: FAKE.into(),
                    handle: options.volume_name.clone(),
                },
                capacity: options.capacity,
                labels: Default::default(),
            })
        }

        async fn is_ready(&self, _volume: &Volume) -> Result<bool> {
            Ok(!self.not_ready.load(Ordering::SeqCst))
        }

        async fn delete(&self, volume: &Volume) -> Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(Error::Internal("delete refused".into()));
            }
            self.deleted.lock().push(volume.metadata.name.clone());
            Ok(())
        }

        async fn recycle(&self, volume: &Volume) -> Result<()> {
            if self.fail_recycle.load(Ordering::SeqCst) {
                return Err(Error::Internal("scrub failed".into()));
            }
            self.recycled.lock().push(volume.metadata.name.clone());
            Ok(())
        }
    }

    pub struct Harness {
        pub stores: MemoryStores,
        pub binder: Binder,
        pub plugin: Arc<FakePlugin>,
    }

    pub fn harness() -> Harness {
        harness_with(ControllerConfig::default())
    }

    pub fn harness_with(config: ControllerConfig) -> Harness {
        let stores = MemoryStores::new();
        let plugin = Arc::new(FakePlugin::default());
        let mut plugins = PluginRegistry::new();
        plugins
            .register(plugin.clone())
            .expect("register fake plugin");
        let binder = Binder::new(
            stores.as_stores(),
            Caches::new(),
            plugins,
            config,
            BinderMetrics::new().expect("metrics"),
        );
        Harness {
            stores,
            binder,
            plugin,
        }
    }

    impl Harness {
        /// Create in the store and mirror into the cache, like an informer would
        pub async fn create_volume(&self, volume: Volume) -> Volume {
            use crate::domain::ResourceStore;
            let created = self.stores.volumes.create(volume).await.expect("create volume");
            self.binder.caches.volumes.store_if_newer(created.clone());
            created
        }

        pub async fn create_claim(&self, claim: Claim) -> Claim {
            use crate::domain::ResourceStore;
            let created = self.stores.claims.create(claim).await.expect("create claim");
            self.binder.caches.claims.store_if_newer(created.clone());
            created
        }

        pub async fn create_class(&self, class: crate::domain::StorageClass) {
            use crate::domain::ResourceStore;
            let created = self.stores.classes.create(class).await.expect("create class");
            self.binder.caches.classes.store_if_newer(created);
        }

        pub async fn delete_claim(&self, claim: &Claim) {
            use crate::domain::ResourceStore;
            self.stores.claims.delete(&claim.key()).await.expect("delete claim");
            self.binder.caches.claims.remove(&claim.key());
        }

        pub async fn volume(&self, name: &str) -> Option<Volume> {
            use crate::domain::{ObjectKey, ResourceStore};
            self.stores.volumes.get(&ObjectKey::cluster(name)).await.expect("get volume")
        }

        pub async fn claim(&self, claim: &Claim) -> Option<Claim> {
            use crate::domain::ResourceStore;
            self.stores.claims.get(&claim.key()).await.expect("get claim")
        }

        /// Wait for spawned provisioning and reclaim tasks
        pub async fn drain(&self) {
            self.binder.tasks.close();
            self.binder.tasks.wait().await;
            self.binder.tasks.reopen();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;
    use crate::domain::{AccessMode, ReclaimPolicy};

    #[tokio::test]
    async fn test_set_volume_phase_writes_once() {
        let h = harness();
        let mut events = h.binder.subscribe();
        let v = h
            .create_volume(Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Retain))
            .await;

        let v = h.binder.set_volume_phase(v, VolumePhase::Available, None).await.unwrap();
        let rv = v.metadata.resource_version.clone();
        let v = h.binder.set_volume_phase(v, VolumePhase::Available, None).await.unwrap();
        assert_eq!(v.metadata.resource_version, rv);

        assert_eq!(
            events.try_recv().unwrap(),
            BinderEvent::VolumeAvailable { volume: "pv".into() }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(h.binder.caches().volumes.get_by_name("pv").unwrap().phase(), VolumePhase::Available);
    }

    #[tokio::test]
    async fn test_claim_bound_status_carries_volume_capacity() {
        let h = harness();
        let v = Volume::new("pv", 10, [AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany], ReclaimPolicy::Retain);
        let c = h
            .create_claim(Claim::new("ns", "c", 4, [AccessMode::ReadWriteOnce]))
            .await;
        let c = h.binder.set_claim_phase(c, ClaimPhase::Bound, Some(&v)).await.unwrap();
        assert_eq!(c.status.capacity, Some(10));
        assert_eq!(c.status.access_modes.len(), 2);
    }
}
