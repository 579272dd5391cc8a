//! Controller Runtime
//!
//! Wires the event source to the binder:
//! - one informer per kind keeps the caches current
//! - a dispatcher maps typed change events to work-queue keys
//! - workers, started once every cache has synced, drain the claim and
//!   volume queues through the binder
//!
//! Shutdown is cooperative: cancelling the token stops the informers and
//! the queues, lets in-flight passes finish, then drains spawned
//! provisioning and reclaim tasks.

use crate::binder::{Binder, PluginRegistry};
use crate::cache::{
    BinderEvent, BinderMetrics, Caches, ControllerEvent, Informer, ResourceEvent, WorkQueue,
};
use crate::config::ControllerConfig;
use crate::domain::{Claim, Resource, StorageClass, Volume, VolumePhase};
use crate::error::{ErrorAction, Result};
use crate::store::Stores;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

// =============================================================================
// Controller Handle
// =============================================================================

/// Read-only view for the operator surface
#[derive(Clone)]
pub struct ControllerHandle {
    binder: Binder,
    synced: Vec<Arc<AtomicBool>>,
}

impl ControllerHandle {
    /// True once every informer has delivered its first list
    pub fn is_ready(&self) -> bool {
        self.synced.iter().all(|s| s.load(Ordering::SeqCst))
    }

    pub fn caches(&self) -> &Caches {
        self.binder.caches()
    }

    pub fn metrics(&self) -> &BinderMetrics {
        self.binder.metrics()
    }

    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BinderEvent> {
        self.binder.subscribe()
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Volume binder controller
pub struct Controller {
    binder: Binder,
    workers: usize,
    volumes: Informer<Volume>,
    claims: Informer<Claim>,
    classes: Informer<StorageClass>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    synced: Vec<Arc<AtomicBool>>,
}

impl Controller {
    pub fn new(stores: Stores, plugins: PluginRegistry, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let metrics = BinderMetrics::new()?;
        let caches = Caches::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let resync = config.sync_period();

        let volumes = Informer::new(stores.volumes.clone(), caches.volumes.clone(), tx.clone(), resync)
            .with_metrics(metrics.clone());
        let claims = Informer::new(stores.claims.clone(), caches.claims.clone(), tx.clone(), resync)
            .with_metrics(metrics.clone());
        let classes = Informer::new(stores.classes.clone(), caches.classes.clone(), tx, resync)
            .with_metrics(metrics.clone());
        let synced = vec![
            volumes.synced_flag(),
            claims.synced_flag(),
            classes.synced_flag(),
        ];

        let workers = config.workers;
        let binder = Binder::new(stores, caches, plugins, config, metrics);
        Ok(Self {
            binder,
            workers,
            volumes,
            claims,
            classes,
            events: rx,
            synced,
        })
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            binder: self.binder.clone(),
            synced: self.synced.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BinderEvent> {
        self.binder.subscribe()
    }

    /// Run until `shutdown` is cancelled, then drain
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Controller {
            binder,
            workers,
            volumes,
            claims,
            classes,
            mut events,
            synced,
        } = self;

        info!(
            workers,
            plugins = ?binder.plugins().names(),
            sync_period_secs = binder.config().sync_period_secs,
            "starting volume binder"
        );

        let tracker = TaskTracker::new();
        tracker.spawn(volumes.run(shutdown.clone()));
        tracker.spawn(claims.run(shutdown.clone()));
        tracker.spawn(classes.run(shutdown.clone()));

        {
            let binder = binder.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => dispatch(&binder, event),
                            None => break,
                        }
                    }
                }
                debug!("dispatcher stopped");
            });
        }

        // Workers must see complete caches: a claim synced against a
        // half-listed volume cache would provision instead of binding
        let ready = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = wait_for_cache_sync(&synced) => true,
        };
        if ready {
            info!("caches synced; starting workers");
            for _ in 0..workers {
                let b = binder.clone();
                tracker.spawn(run_worker(b.claim_queue().clone(), "claim", b.metrics().clone(), move |key| {
                    let b = b.clone();
                    async move { b.sync_claim(&key).await }.boxed()
                }));
                let b = binder.clone();
                tracker.spawn(run_worker(b.volume_queue().clone(), "volume", b.metrics().clone(), move |key| {
                    let b = b.clone();
                    async move { b.sync_volume(&key).await }.boxed()
                }));
            }
        }

        shutdown.cancelled().await;
        info!("shutdown requested; draining");
        binder.claim_queue().shutdown();
        binder.volume_queue().shutdown();

        tracker.close();
        tracker.wait().await;
        binder.tasks().close();
        binder.tasks().wait().await;
        info!("volume binder stopped");
        Ok(())
    }
}

/// Resolve once every informer has delivered its first list
async fn wait_for_cache_sync(synced: &[Arc<AtomicBool>]) {
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if synced.iter().all(|s| s.load(Ordering::SeqCst)) {
            return;
        }
        tick.tick().await;
    }
}

/// Pull keys until the queue shuts down
async fn run_worker<F>(queue: WorkQueue, kind: &'static str, metrics: BinderMetrics, sync: F)
where
    F: Fn(String) -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    while let Some(key) = queue.get().await {
        metrics
            .queue_depth
            .with_label_values(&[queue.name()])
            .set(queue.len() as i64);

        let started = Instant::now();
        let result = sync(key.clone()).await;
        metrics
            .reconcile_duration
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => queue.forget(&key),
            Err(e) => match e.action() {
                ErrorAction::RequeueWithBackoff => {
                    let delay = queue.add_rate_limited(key.clone());
                    if e.is_conflict() {
                        debug!(kind, key = %key, error = %e, "conflict; retrying");
                    } else {
                        warn!(kind, key = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "sync failed; retrying");
                    }
                }
                ErrorAction::RequeueAfter(delay) => {
                    warn!(kind, key = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "sync failed");
                    queue.add_after(key.clone(), delay);
                }
                ErrorAction::NoRequeue => {
                    warn!(kind, key = %key, error = %e, "sync failed; waiting for the object to change");
                    queue.forget(&key);
                }
            },
        }
        queue.done(&key);
    }
    debug!(kind, "worker stopped");
}

// =============================================================================
// Event Dispatch
// =============================================================================

/// Map a change to the keys it affects
pub fn dispatch(binder: &Binder, event: ControllerEvent) {
    match event {
        ControllerEvent::Volume(event) => dispatch_volume(binder, event),
        ControllerEvent::Claim(event) => dispatch_claim(binder, event),
        ControllerEvent::StorageClass(event) => match event {
            ResourceEvent::Added(class) | ResourceEvent::Updated { new: class, .. } => {
                binder.enqueue_claims_for_class(class.name());
            }
            ResourceEvent::Deleted(_) | ResourceEvent::Resynced(_) => {}
        },
    }
}

fn dispatch_volume(binder: &Binder, event: ResourceEvent<Volume>) {
    match event {
        ResourceEvent::Deleted(volume) => {
            if let Some(claim_ref) = &volume.spec.claim_ref {
                binder.claim_queue().add(claim_ref.key().to_string());
            }
            for claim in binder
                .caches()
                .claims
                .list_filtered(|c| c.spec.volume_name == volume.metadata.name)
            {
                binder.claim_queue().add(claim.key().to_string());
            }
            binder.forget_volume(&volume.metadata.name);
            binder.locks().prune();
        }
        ResourceEvent::Added(volume) | ResourceEvent::Updated { new: volume, .. } => {
            binder.volume_queue().add(volume.metadata.name.clone());
            if volume.phase() == VolumePhase::Available {
                match &volume.spec.claim_ref {
                    Some(claim_ref) => binder.claim_queue().add(claim_ref.key().to_string()),
                    None => binder.enqueue_pending_claims(),
                }
            }
        }
        ResourceEvent::Resynced(volume) => {
            binder.volume_queue().add(volume.metadata.name.clone());
        }
    }
}

fn dispatch_claim(binder: &Binder, event: ResourceEvent<Claim>) {
    match event {
        ResourceEvent::Deleted(claim) => {
            if !claim.is_unbound() {
                binder.volume_queue().add(claim.spec.volume_name.clone());
            }
            for volume in binder.caches().volumes.list_filtered(|v| {
                v.spec.claim_ref.as_ref().map_or(false, |r| r.names(&claim))
            }) {
                binder.volume_queue().add(volume.metadata.name.clone());
            }
            binder.locks().prune();
        }
        other => binder.claim_queue().add(other.key().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::testing::{harness, FAKE};
    use crate::domain::{AccessMode, ClaimRef, ReclaimPolicy, ResourceStore, VolumeSource};
    use crate::store::MemoryStores;

    fn controller() -> Controller {
        Controller::new(
            MemoryStores::new().as_stores(),
            PluginRegistry::new(),
            ControllerConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_available_volume_enqueues_pending_claims() {
        let c = controller();
        let binder = &c.binder;
        let mut claim = Claim::new("ns", "c", 1, [AccessMode::ReadWriteOnce]);
        claim.metadata.resource_version = "1".into();
        binder.caches().claims.store_if_newer(claim);

        let mut volume = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Retain);
        volume.status.phase = VolumePhase::Available;
        dispatch(binder, ControllerEvent::Volume(ResourceEvent::Added(volume)));

        assert_eq!(binder.volume_queue().len(), 1);
        assert_eq!(binder.claim_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_deleted_claim_enqueues_its_volumes() {
        let c = controller();
        let binder = &c.binder;
        let mut volume = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Retain)
            .pre_bound_to(ClaimRef::new("ns", "c"));
        volume.metadata.resource_version = "1".into();
        binder.caches().volumes.store_if_newer(volume);

        let claim = Claim::new("ns", "c", 1, [AccessMode::ReadWriteOnce]).with_volume_name("other");
        dispatch(binder, ControllerEvent::Claim(ResourceEvent::Deleted(claim)));
        assert_eq!(binder.volume_queue().len(), 2);
        assert_eq!(binder.claim_queue().len(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_deleted_volume_forgets_reclaim_backoff() {
        let h = harness();
        h.plugin.fail_delete.store(true, Ordering::SeqCst);
        let mut volume = Volume::new("pv", 5, [AccessMode::ReadWriteOnce], ReclaimPolicy::Delete)
            .with_source(VolumeSource::External {
                driver: FAKE.into(),
                handle: "pv".into(),
            });
        volume.status.phase = VolumePhase::Available;
        h.create_volume(volume).await;
        let c = h.create_claim(Claim::new("ns", "c", 1, [AccessMode::ReadWriteOnce])).await;
        h.binder.sync_claim(&c.key().to_string()).await.unwrap();
        h.delete_claim(&c).await;
        h.binder.sync_volume("pv").await.unwrap();
        h.drain().await;
        assert_eq!(h.binder.reclaim_failure_count("pv"), Some(1));

        // Removed behind the binder's back while backing off
        let gone = h.volume("pv").await.unwrap();
        h.stores.volumes.delete(&gone.key()).await.unwrap();
        h.binder.caches().volumes.remove(&gone.key());
        dispatch(&h.binder, ControllerEvent::Volume(ResourceEvent::Deleted(gone)));

        assert_eq!(h.binder.reclaim_failure_count("pv"), None);
        assert!(h.binder.locks().is_empty());
    }

    #[tokio::test]
    async fn test_readiness_follows_informers() {
        let stores = MemoryStores::new();
        let controller = Controller::new(stores.as_stores(), PluginRegistry::new(), ControllerConfig::default()).unwrap();
        let handle = controller.handle();
        assert!(!handle.is_ready());

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(controller.run(shutdown.clone()));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !handle.is_ready() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }
}
