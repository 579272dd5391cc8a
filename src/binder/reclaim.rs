//! Reclaim Worker
//!
//! Applies a Released volume's reclaim policy once its claim is confirmed
//! gone. Idempotent: a reclaim that finds the volume no longer Released, or
//! already deleted, does nothing.
//!
//! - **Retain**: nothing; an administrator reclaims by hand
//! - **Recycle**: scrub the asset and return the volume to Available; a
//!   failure is terminal (Failed)
//! - **Delete**: destroy the asset, then the volume object; a failure
//!   leaves the volume Released and retries with backoff

use super::{volume_lock, Binder};
use crate::cache::BinderEvent;
use crate::domain::{ClaimRef, ObjectKey, ReclaimPolicy, Volume, VolumePhase};
use crate::error::{Error, Result};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Binder {
    /// Spawn a reclaim for `volume` unless one is running or backing off
    pub(crate) fn schedule_reclaim(&self, volume: &Volume) {
        let policy = volume.spec.reclaim_policy;
        let name = volume.metadata.name.clone();
        if policy == ReclaimPolicy::Retain {
            debug!(volume = %name, "retain policy; leaving volume released");
            return;
        }
        if let Some(entry) = self.reclaim_failures.get(&name) {
            let (_, next_attempt) = *entry.value();
            if Instant::now() < next_attempt {
                debug!(volume = %name, "reclaim backing off");
                return;
            }
        }
        if !self.reclaiming.insert(name.clone()) {
            return;
        }

        let binder = self.clone();
        self.tasks.spawn(async move {
            let result = binder.reclaim(&name).await;
            binder.reclaiming.remove(&name);
            match result {
                Ok(()) => {
                    binder.reclaim_failures.remove(&name);
                }
                Err(e) => binder.reclaim_failed(&name, policy, e),
            }
        });
    }

    /// Run the reclaim policy of a Released volume
    pub async fn reclaim(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(&volume_lock(name)).await;
        let volume = match self.refresh_volume(name).await? {
            Some(v) => v,
            None => return Ok(()),
        };
        if volume.phase() != VolumePhase::Released {
            debug!(volume = %name, phase = %volume.phase(), "volume no longer released");
            return Ok(());
        }
        if let Some(claim_ref) = &volume.spec.claim_ref {
            if !self.claim_released(claim_ref, &volume).await? {
                debug!(volume = %name, claim = %claim_ref.key(), "claim still uses volume; not reclaiming");
                return Ok(());
            }
        }

        match volume.spec.reclaim_policy {
            ReclaimPolicy::Retain => Ok(()),
            ReclaimPolicy::Recycle => self.recycle(volume).await,
            ReclaimPolicy::Delete => self.delete(volume).await,
        }
    }

    /// Claim is gone, or now bound to some other volume
    async fn claim_released(&self, claim_ref: &ClaimRef, volume: &Volume) -> Result<bool> {
        Ok(match self.lookup_claim(claim_ref).await? {
            None => true,
            Some(claim) => {
                !claim.spec.volume_name.is_empty() && claim.spec.volume_name != volume.metadata.name
            }
        })
    }

    async fn recycle(&self, volume: Volume) -> Result<()> {
        let name = volume.metadata.name.clone();
        let outcome = if volume.spec.source.is_none() {
            // No asset to scrub
            Ok(())
        } else {
            match self.plugins.find_recycler(&volume) {
                Some(plugin) => {
                    info!(volume = %name, plugin = %plugin.name(), "recycling volume");
                    plugin.recycle(&volume).await
                }
                None => Err(Error::PluginNotFound {
                    volume: name.clone(),
                    operation: "recycle".into(),
                }),
            }
        };

        match outcome {
            Ok(()) => {
                let mut updated = volume;
                if updated.markers.bound_by_controller {
                    updated.spec.claim_ref = None;
                    updated.markers.bound_by_controller = false;
                } else if let Some(claim_ref) = updated.spec.claim_ref.as_mut() {
                    // Keep the administrator's pre-bind
                    claim_ref.uid.clear();
                }
                let updated = self.update_volume(updated).await?;
                self.set_volume_phase(updated, VolumePhase::Available, None)
                    .await?;
                self.metrics
                    .reclaims
                    .with_label_values(&["Recycle", "success"])
                    .inc();
                self.emit(BinderEvent::Recycled { volume: name });
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(volume = %name, error = %reason, "recycle failed; volume needs an administrator");
                self.set_volume_phase(volume, VolumePhase::Failed, Some(format!("recycle failed: {}", reason)))
                    .await?;
                self.metrics
                    .reclaims
                    .with_label_values(&["Recycle", "failure"])
                    .inc();
                self.emit(BinderEvent::ReclaimFailed {
                    volume: name,
                    reason,
                });
                Ok(())
            }
        }
    }

    async fn delete(&self, volume: Volume) -> Result<()> {
        let name = volume.metadata.name.clone();
        let has_asset = volume.spec.source.is_some() || volume.markers.provisioned_by.is_some();
        if has_asset {
            let plugin = self
                .plugins
                .find_deleter(&volume)
                .ok_or_else(|| Error::PluginNotFound {
                    volume: name.clone(),
                    operation: "delete".into(),
                })?;
            info!(volume = %name, plugin = %plugin.name(), "deleting volume asset");
            plugin.delete(&volume).await.map_err(|e| Error::ReclaimFailed {
                volume: name.clone(),
                reason: e.to_string(),
            })?;
        }

        let key = ObjectKey::cluster(&name);
        match self.stores.volumes.delete(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.caches.volumes.remove(&key);

        info!(volume = %name, "volume deleted");
        self.metrics
            .reclaims
            .with_label_values(&["Delete", "success"])
            .inc();
        self.emit(BinderEvent::VolumeDeleted { volume: name });
        Ok(())
    }

    /// Drop reclaim bookkeeping for a volume that no longer exists
    pub(crate) fn forget_volume(&self, name: &str) {
        if self.reclaim_failures.remove(name).is_some() {
            debug!(volume = %name, "dropped reclaim backoff for deleted volume");
        }
    }

    #[cfg(test)]
    pub(crate) fn reclaim_failure_count(&self, name: &str) -> Option<u32> {
        self.reclaim_failures.get(name).map(|entry| entry.0)
    }

    /// Back off and requeue; the volume stays Released
    fn reclaim_failed(&self, name: &str, policy: ReclaimPolicy, err: Error) {
        let (failures, delay) = {
            let mut entry = self
                .reclaim_failures
                .entry(name.to_string())
                .or_insert((0, Instant::now()));
            let failures = entry.0.saturating_add(1);
            let delay = self.config.reclaim_backoff(failures);
            *entry = (failures, Instant::now() + delay);
            (failures, delay)
        };

        warn!(
            volume = %name,
            policy = %policy,
            failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "reclaim failed"
        );
        self.metrics
            .reclaims
            .with_label_values(&[&policy.to_string(), "failure"])
            .inc();
        self.emit(BinderEvent::ReclaimFailed {
            volume: name.to_string(),
            reason: err.to_string(),
        });
        self.volume_queue.add_after(name.to_string(), delay);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, Harness, FAKE};
    use super::*;
    use crate::domain::{AccessMode, Claim, Resource, VolumeSource};
    use assert_matches::assert_matches;
    use std::sync::atomic::Ordering;

    fn fake_volume(name: &str, policy: ReclaimPolicy) -> Volume {
        let mut v = Volume::new(name, 5, [AccessMode::ReadWriteOnce], policy).with_source(
            VolumeSource::External {
                driver: FAKE.into(),
                handle: name.into(),
            },
        );
        v.status.phase = VolumePhase::Available;
        v
    }

    /// Bind a claim to `volume`, then delete the claim and sync the volume
    async fn bind_and_release(h: &Harness, volume: Volume) {
        let name = volume.metadata.name.clone();
        h.create_volume(volume).await;
        let c = h
            .create_claim(Claim::new("ns", "c", 1, [AccessMode::ReadWriteOnce]))
            .await;
        h.binder.sync_claim(&c.key().to_string()).await.unwrap();
        h.delete_claim(&c).await;
        h.binder.sync_volume(&name).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_policy_removes_volume_and_asset() {
        let h = harness();
        bind_and_release(&h, fake_volume("pv", ReclaimPolicy::Delete)).await;
        h.drain().await;

        assert!(h.volume("pv").await.is_none());
        assert!(h.binder.caches().volumes.get_by_name("pv").is_none());
        assert_eq!(*h.plugin.deleted.lock(), vec!["pv".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_released_and_retries() {
        let h = harness();
        h.plugin.fail_delete.store(true, Ordering::SeqCst);
        let mut events = h.binder.subscribe();
        bind_and_release(&h, fake_volume("pv", ReclaimPolicy::Delete)).await;
        h.drain().await;

        let v = h.volume("pv").await.unwrap();
        assert_eq!(v.phase(), VolumePhase::Released);
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, BinderEvent::ReclaimFailed { .. });
        }
        assert!(saw_failure);

        // Inside the backoff window nothing is attempted
        h.plugin.fail_delete.store(false, Ordering::SeqCst);
        h.binder.sync_volume("pv").await.unwrap();
        h.drain().await;
        assert!(h.volume("pv").await.is_some());

        // The reclaim itself is idempotent and succeeds once the plugin recovers
        h.binder.reclaim("pv").await.unwrap();
        assert!(h.volume("pv").await.is_none());
    }

    #[tokio::test]
    async fn test_recycle_returns_volume_to_pool() {
        let h = harness();
        bind_and_release(&h, fake_volume("pv", ReclaimPolicy::Recycle)).await;
        h.drain().await;

        let v = h.volume("pv").await.unwrap();
        assert_eq!(v.phase(), VolumePhase::Available);
        assert!(v.spec.claim_ref.is_none());
        assert!(!v.markers.bound_by_controller);
        assert_eq!(*h.plugin.recycled.lock(), vec!["pv".to_string()]);
    }

    #[tokio::test]
    async fn test_recycle_failure_is_terminal() {
        let h = harness();
        h.plugin.fail_recycle.store(true, Ordering::SeqCst);
        bind_and_release(&h, fake_volume("pv", ReclaimPolicy::Recycle)).await;
        h.drain().await;

        let v = h.volume("pv").await.unwrap();
        assert_eq!(v.phase(), VolumePhase::Failed);
        assert!(v.status.message.unwrap().contains("scrub failed"));

        // Failed volumes are left alone
        h.binder.sync_volume("pv").await.unwrap();
        h.drain().await;
        assert_eq!(h.volume("pv").await.unwrap().phase(), VolumePhase::Failed);
    }

    #[tokio::test]
    async fn test_missing_deleter_keeps_released() {
        let h = harness();
        let mut v = fake_volume("pv", ReclaimPolicy::Delete);
        v.spec.source = Some(VolumeSource::External {
            driver: "unknown.example.com".into(),
            handle: "x".into(),
        });
        bind_and_release(&h, v).await;
        h.drain().await;
        assert_eq!(h.volume("pv").await.unwrap().phase(), VolumePhase::Released);
    }

    #[tokio::test]
    async fn test_reclaim_skips_non_released() {
        let h = harness();
        h.create_volume(fake_volume("pv", ReclaimPolicy::Delete)).await;
        h.binder.reclaim("pv").await.unwrap();
        assert!(h.volume("pv").await.is_some());
        assert_matches!(h.binder.reclaim("missing").await, Ok(()));
    }
}
