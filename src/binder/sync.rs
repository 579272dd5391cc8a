//! Claim and Volume Reconciliation
//!
//! Level-triggered: each pass reads the latest cached state of one object
//! and moves it one step closer to a consistent binding. Passes are
//! idempotent, so a consistent pair produces no writes at all.

use super::{claim_lock, matcher, volume_lock, Binder};
use crate::cache::BinderEvent;
use crate::domain::{
    Claim, ClaimPhase, ClaimRef, ObjectKey, Resource, ResourceStore, Volume, VolumePhase,
};
use crate::error::{Error, Result};
use tracing::{debug, info, warn};

impl Binder {
    // =========================================================================
    // Claims
    // =========================================================================

    /// Reconcile the claim stored under `key` (`namespace/name`)
    pub async fn sync_claim(&self, key: &str) -> Result<()> {
        let _guard = self.locks.lock(&claim_lock(key)).await;
        let claim = match self.caches.claims.get(&ObjectKey::parse(key)) {
            Some(claim) => claim,
            None => {
                debug!(claim = %key, "claim gone; nothing to do");
                return Ok(());
            }
        };

        if claim.is_unbound() {
            self.sync_unbound_claim(claim).await
        } else {
            self.sync_bound_claim(claim).await
        }
    }

    /// Claim without a volume name: match, then bind or provision
    async fn sync_unbound_claim(&self, mut claim: Claim) -> Result<()> {
        let key = claim.key().to_string();
        let default_class = self.config.default_class();
        let budget = self.config.bind_retry_budget;
        let mut attempts = 0;

        loop {
            let volumes = self.caches.volumes.list();
            let candidate = match matcher::find_match(&claim, &volumes, default_class) {
                Some(v) => v.metadata.name.clone(),
                None => return self.no_match(claim).await,
            };

            let _volume_guard = self.locks.lock(&volume_lock(&candidate)).await;
            let volume = match self.caches.volumes.get_by_name(&candidate) {
                Some(v) if matcher::is_candidate(&v, &claim, default_class) => v,
                _ => {
                    // Changed while we waited for the lock
                    attempts += 1;
                    if attempts >= budget {
                        return Err(self.budget_exhausted(&key, attempts));
                    }
                    continue;
                }
            };

            match self.bind(claim.clone(), volume).await {
                Ok(_) => {
                    self.metrics.bind_attempts.with_label_values(&["bound"]).inc();
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    self.metrics.bind_attempts.with_label_values(&["conflict"]).inc();
                    attempts += 1;
                    debug!(claim = %key, volume = %candidate, attempts, "bind lost a race; re-evaluating");

                    self.refresh_volume(&candidate).await?;
                    claim = match self.refresh_claim(&claim.key()).await? {
                        Some(c) if c.metadata.uid == claim.metadata.uid => c,
                        _ => return Ok(()),
                    };
                    if !claim.is_unbound() {
                        // Someone else finished the bind; take the bound path
                        self.claim_queue.add(key);
                        return Ok(());
                    }
                    if attempts >= budget {
                        return Err(self.budget_exhausted(&key, attempts));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn budget_exhausted(&self, key: &str, attempts: u32) -> Error {
        Error::RetryBudgetExhausted {
            kind: Claim::KIND.to_string(),
            name: key.to_string(),
            attempts,
        }
    }

    /// Nothing matched: provision if the class allows it, otherwise wait
    async fn no_match(&self, claim: Claim) -> Result<()> {
        let class_name = claim
            .spec
            .storage_class
            .resolve(self.config.default_class())
            .to_string();

        if !class_name.is_empty() && self.config.enable_dynamic_provisioning {
            match self.caches.classes.get_by_name(&class_name) {
                Some(class) if self.plugins.get(&class.provisioner).is_some() => {
                    return self.provision_claim(claim, class).await;
                }
                Some(class) => {
                    debug!(
                        claim = %claim.key(),
                        provisioner = %class.provisioner,
                        "no local plugin for provisioner; waiting for a volume"
                    );
                }
                None => debug!(claim = %claim.key(), class = %class_name, "storage class not found"),
            }
        }

        self.metrics.bind_attempts.with_label_values(&["no_match"]).inc();
        self.set_claim_phase(claim, ClaimPhase::Pending, None).await?;
        Ok(())
    }

    /// Claim naming a volume: finish the bind or report it lost
    async fn sync_bound_claim(&self, claim: Claim) -> Result<()> {
        let volume_name = claim.spec.volume_name.clone();
        let _volume_guard = self.locks.lock(&volume_lock(&volume_name)).await;

        let volume = match self.caches.volumes.get_by_name(&volume_name) {
            Some(v) => Some(v),
            None => self.refresh_volume(&volume_name).await?,
        };

        let volume = match volume {
            Some(v) => v,
            None if claim.markers.bind_completed => {
                return self.mark_claim_lost(claim, &volume_name).await;
            }
            None => {
                debug!(claim = %claim.key(), volume = %volume_name, "requested volume does not exist yet");
                self.set_claim_phase(claim, ClaimPhase::Pending, None).await?;
                return Ok(());
            }
        };

        match &volume.spec.claim_ref {
            None => {
                if claim.markers.bind_completed
                    || matcher::satisfies(&volume, &claim, self.config.default_class())
                {
                    self.bind(claim, volume).await?;
                } else {
                    debug!(claim = %claim.key(), volume = %volume_name, "requested volume does not satisfy claim");
                    self.set_claim_phase(claim, ClaimPhase::Pending, None).await?;
                }
            }
            Some(claim_ref) if claim_ref.refers_to(&claim) => {
                self.bind(claim, volume).await?;
            }
            Some(claim_ref) => {
                if claim.markers.bind_completed {
                    return self.mark_claim_lost(claim, &volume_name).await;
                }
                debug!(
                    claim = %claim.key(),
                    volume = %volume_name,
                    owner = %claim_ref.key(),
                    "requested volume belongs to another claim"
                );
                self.set_claim_phase(claim, ClaimPhase::Pending, None).await?;
            }
        }
        Ok(())
    }

    async fn mark_claim_lost(&self, claim: Claim, volume_name: &str) -> Result<()> {
        if claim.phase() == ClaimPhase::Lost {
            return Ok(());
        }
        let key = claim.key().to_string();
        warn!(claim = %key, volume = %volume_name, "bound volume is gone; claim lost");
        self.set_claim_phase(claim, ClaimPhase::Lost, None).await?;
        self.emit(BinderEvent::ClaimLost {
            claim: key,
            volume: volume_name.to_string(),
        });
        Ok(())
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Write both halves of a binding, volume first
    ///
    /// Claiming the volume first means racing claims collide on the
    /// volume's version and only one wins. Each half is a no-op when
    /// already in place.
    pub(crate) async fn bind(&self, claim: Claim, volume: Volume) -> Result<(Claim, Volume)> {
        let (volume, volume_changed) = self.bind_volume_to_claim(volume, &claim).await?;
        let (claim, claim_changed) = self.bind_claim_to_volume(claim, &volume).await?;

        if volume_changed || claim_changed {
            info!(claim = %claim.key(), volume = %volume.metadata.name, "bound");
            self.emit(BinderEvent::Bound {
                claim: claim.key().to_string(),
                volume: volume.metadata.name.clone(),
            });
        }
        Ok((claim, volume))
    }

    async fn bind_volume_to_claim(&self, volume: Volume, claim: &Claim) -> Result<(Volume, bool)> {
        let mut changed = false;
        let mut volume = volume;
        let full = ClaimRef::to_claim(claim);

        if volume.spec.claim_ref.as_ref() != Some(&full) {
            let mut updated = volume.clone();
            if updated.spec.claim_ref.is_none() {
                updated.markers.bound_by_controller = true;
            }
            updated.spec.claim_ref = Some(full);
            volume = self.update_volume(updated).await?;
            changed = true;
        }
        if volume.phase() != VolumePhase::Bound {
            volume = self.set_volume_phase(volume, VolumePhase::Bound, None).await?;
            changed = true;
        }
        Ok((volume, changed))
    }

    async fn bind_claim_to_volume(&self, claim: Claim, volume: &Volume) -> Result<(Claim, bool)> {
        let mut changed = false;
        let mut claim = claim;

        if claim.spec.volume_name != volume.metadata.name || !claim.markers.bind_completed {
            let mut updated = claim.clone();
            if updated.spec.volume_name.is_empty() {
                updated.markers.bound_by_controller = true;
            }
            updated.spec.volume_name = volume.metadata.name.clone();
            updated.markers.bind_completed = true;
            claim = self.update_claim(updated).await?;
            changed = true;
        }
        if claim.phase() != ClaimPhase::Bound || claim.status.capacity != Some(volume.spec.capacity) {
            claim = self.set_claim_phase(claim, ClaimPhase::Bound, Some(volume)).await?;
            changed = true;
        }
        Ok((claim, changed))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Reconcile the volume named `name`
    pub async fn sync_volume(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(&volume_lock(name)).await;
        let volume = match self.caches.volumes.get_by_name(name) {
            Some(v) => v,
            None => {
                debug!(volume = %name, "volume gone; nothing to do");
                return Ok(());
            }
        };

        let claim_ref = match volume.spec.claim_ref.clone() {
            None => {
                self.set_volume_phase(volume, VolumePhase::Available, None).await?;
                return Ok(());
            }
            Some(r) => r,
        };

        if claim_ref.uid.is_empty() {
            // Pre-bound by an administrator; the claim loop completes it
            self.set_volume_phase(volume, VolumePhase::Available, None).await?;
            self.claim_queue.add(claim_ref.key().to_string());
            return Ok(());
        }

        match self.lookup_claim(&claim_ref).await? {
            None => self.volume_claim_gone(volume, &claim_ref).await,
            Some(claim) if claim.is_unbound() => self.volume_claim_unbound(volume, claim).await,
            Some(claim) if claim.spec.volume_name == volume.metadata.name => {
                self.set_volume_phase(volume, VolumePhase::Bound, None).await?;
                Ok(())
            }
            Some(claim) => self.volume_claim_elsewhere(volume, claim).await,
        }
    }

    /// The referenced claim no longer exists
    async fn volume_claim_gone(&self, volume: Volume, claim_ref: &ClaimRef) -> Result<()> {
        match volume.phase() {
            VolumePhase::Failed => Ok(()),
            VolumePhase::Released => {
                self.schedule_reclaim(&volume);
                Ok(())
            }
            VolumePhase::Bound | VolumePhase::Available | VolumePhase::Pending
                if volume.markers.bound_by_controller || volume.phase() == VolumePhase::Bound =>
            {
                info!(volume = %volume.metadata.name, claim = %claim_ref.key(), "claim deleted; releasing volume");
                let released = self
                    .set_volume_phase(volume, VolumePhase::Released, None)
                    .await?;
                self.schedule_reclaim(&released);
                Ok(())
            }
            _ => {
                let err = Error::PermanentMismatch {
                    volume: volume.metadata.name.clone(),
                    claim: claim_ref.key().to_string(),
                };
                warn!(volume = %volume.metadata.name, claim = %claim_ref.key(), "pre-bound claim will never exist");
                self.set_volume_phase(volume, VolumePhase::Failed, Some(err.to_string()))
                    .await?;
                Ok(())
            }
        }
    }

    /// Claim exists but has not recorded the binding yet
    async fn volume_claim_unbound(&self, volume: Volume, claim: Claim) -> Result<()> {
        let name = volume.metadata.name.clone();
        if volume.phase() == VolumePhase::Pending {
            if let Some(provisioner) = volume.markers.provisioned_by.as_deref() {
                let ready = match self.plugins.get(provisioner) {
                    Some(plugin) => plugin.is_ready(&volume).await?,
                    None => true,
                };
                if !ready {
                    debug!(volume = %name, plugin = %provisioner, "provisioned volume not ready yet");
                    self.volume_queue
                        .add_after(name, self.config.provision_backoff(1));
                    return Ok(());
                }
            }
            self.set_volume_phase(volume, VolumePhase::Available, None)
                .await?;
        }
        self.claim_queue.add(claim.key().to_string());
        Ok(())
    }

    /// Claim is bound to a different volume
    async fn volume_claim_elsewhere(&self, volume: Volume, claim: Claim) -> Result<()> {
        let name = volume.metadata.name.clone();

        // Act only on the authoritative copy
        let claim = match self.refresh_claim(&claim.key()).await? {
            Some(c) if c.metadata.uid == claim.metadata.uid
                && !c.spec.volume_name.is_empty()
                && c.spec.volume_name != name => c,
            _ => {
                self.volume_queue.add(name);
                return Ok(());
            }
        };

        if volume.markers.bound_by_controller {
            if volume.markers.provisioned_by.is_some() {
                info!(volume = %name, claim = %claim.key(), "provisioned volume lost its claim; releasing");
                let released = self
                    .set_volume_phase(volume, VolumePhase::Released, None)
                    .await?;
                self.schedule_reclaim(&released);
                return Ok(());
            }
            info!(volume = %name, claim = %claim.key(), "claim bound elsewhere; unbinding volume");
            let mut updated = volume;
            updated.spec.claim_ref = None;
            updated.markers.bound_by_controller = false;
            let updated = self.update_volume(updated).await?;
            self.set_volume_phase(updated, VolumePhase::Available, None)
                .await?;
        } else {
            info!(volume = %name, claim = %claim.key(), "claim bound elsewhere; keeping pre-bind");
            let mut updated = volume;
            if let Some(r) = updated.spec.claim_ref.as_mut() {
                r.uid.clear();
            }
            let updated = self.update_volume(updated).await?;
            self.set_volume_phase(updated, VolumePhase::Available, None)
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Store Lookups
    // =========================================================================

    /// Claim `claim_ref` points at, confirming cache misses with the store
    pub(crate) async fn lookup_claim(&self, claim_ref: &ClaimRef) -> Result<Option<Claim>> {
        let matches = |c: &Claim| claim_ref.uid.is_empty() || c.metadata.uid == claim_ref.uid;
        if let Some(claim) = self.caches.claims.get(&claim_ref.key()).filter(|c| matches(c)) {
            return Ok(Some(claim));
        }
        // Cache lag must never release a live binding
        Ok(self.refresh_claim(&claim_ref.key()).await?.filter(|c| matches(c)))
    }

    pub(crate) async fn refresh_claim(&self, key: &ObjectKey) -> Result<Option<Claim>> {
        let claim = self.stores.claims.get(key).await?;
        if let Some(c) = &claim {
            self.caches.claims.store_if_newer(c.clone());
        }
        Ok(claim)
    }

    pub(crate) async fn refresh_volume(&self, name: &str) -> Result<Option<Volume>> {
        let volume = self.stores.volumes.get(&ObjectKey::cluster(name)).await?;
        if let Some(v) = &volume {
            self.caches.volumes.store_if_newer(v.clone());
        }
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::harness;
    use crate::cache::BinderEvent;
    use crate::domain::{
        AccessMode, Claim, ClaimPhase, ClaimRef, ObjectKey, ReclaimPolicy, Resource,
        ResourceStore, Volume, VolumePhase,
    };
    use assert_matches::assert_matches;

    const RWO: AccessMode = AccessMode::ReadWriteOnce;

    fn available(name: &str, capacity: u64) -> Volume {
        let mut v = Volume::new(name, capacity, [RWO], ReclaimPolicy::Retain);
        v.status.phase = VolumePhase::Available;
        v
    }

    #[tokio::test]
    async fn test_claim_binds_best_fit() {
        let h = harness();
        h.create_volume(available("small", 5)).await;
        h.create_volume(available("big", 50)).await;
        let c = h.create_claim(Claim::new("ns", "c", 3, [RWO])).await;
        let mut events = h.binder.subscribe();

        h.binder.sync_claim("ns/c").await.unwrap();

        let v = h.volume("small").await.unwrap();
        assert_eq!(v.phase(), VolumePhase::Bound);
        assert!(v.is_bound_to(&c));
        assert!(v.markers.bound_by_controller);

        let c = h.claim(&c).await.unwrap();
        assert_eq!(c.spec.volume_name, "small");
        assert_eq!(c.phase(), ClaimPhase::Bound);
        assert_eq!(c.status.capacity, Some(5));
        assert!(c.markers.bind_completed);
        assert!(c.markers.bound_by_controller);

        assert_matches!(events.try_recv(), Ok(BinderEvent::Bound { volume, .. }) if volume == "small");
        assert_eq!(h.volume("big").await.unwrap().phase(), VolumePhase::Available);
    }

    #[tokio::test]
    async fn test_consistent_pair_is_untouched() {
        let h = harness();
        h.create_volume(available("pv", 5)).await;
        let c = h.create_claim(Claim::new("ns", "c", 5, [RWO])).await;
        h.binder.sync_claim("ns/c").await.unwrap();

        let before_v = h.volume("pv").await.unwrap();
        let before_c = h.claim(&c).await.unwrap();
        h.binder.sync_claim("ns/c").await.unwrap();
        h.binder.sync_volume("pv").await.unwrap();

        assert_eq!(h.volume("pv").await.unwrap().metadata.resource_version, before_v.metadata.resource_version);
        assert_eq!(h.claim(&c).await.unwrap().metadata.resource_version, before_c.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_no_match_leaves_claim_pending() {
        let h = harness();
        h.create_volume(available("tiny", 1)).await;
        let c = h.create_claim(Claim::new("ns", "c", 10, [RWO])).await;
        h.binder.sync_claim("ns/c").await.unwrap();
        let c = h.claim(&c).await.unwrap();
        assert!(c.is_unbound());
        assert_eq!(c.phase(), ClaimPhase::Pending);
    }

    #[tokio::test]
    async fn test_bind_conflict_falls_through_to_next_candidate() {
        let h = harness();
        let first = h.create_volume(available("first", 5)).await;
        h.create_volume(available("second", 6)).await;
        h.create_claim(Claim::new("ns", "c", 5, [RWO])).await;

        // Another writer takes "first" behind the cache's back
        let mut stolen = first.clone();
        stolen.spec.claim_ref = Some(ClaimRef {
            namespace: "ns".into(),
            name: "other".into(),
            uid: "uid-other".into(),
        });
        h.stores.volumes.update(stolen).await.unwrap();

        h.binder.sync_claim("ns/c").await.unwrap();

        let c = h.stores.claims.get(&ObjectKey::namespaced("ns", "c")).await.unwrap().unwrap();
        assert_eq!(c.spec.volume_name, "second");
        assert_eq!(h.volume("first").await.unwrap().spec.claim_ref.unwrap().name, "other");
    }

    #[tokio::test]
    async fn test_user_prebound_claim() {
        let h = harness();
        h.create_volume(available("wanted", 10)).await;
        h.create_volume(available("smaller", 2)).await;
        let c = h
            .create_claim(Claim::new("ns", "c", 1, [RWO]).with_volume_name("wanted"))
            .await;

        h.binder.sync_claim("ns/c").await.unwrap();

        let v = h.volume("wanted").await.unwrap();
        assert!(v.is_bound_to(&c));
        let c = h.claim(&c).await.unwrap();
        assert_eq!(c.phase(), ClaimPhase::Bound);
        // User chose the volume
        assert!(!c.markers.bound_by_controller);
    }

    #[tokio::test]
    async fn test_prebound_claim_waits_for_missing_volume() {
        let h = harness();
        let c = h
            .create_claim(Claim::new("ns", "c", 1, [RWO]).with_volume_name("later"))
            .await;
        h.binder.sync_claim("ns/c").await.unwrap();
        assert_eq!(h.claim(&c).await.unwrap().phase(), ClaimPhase::Pending);

        h.create_volume(available("later", 1)).await;
        h.binder.sync_claim("ns/c").await.unwrap();
        assert_eq!(h.claim(&c).await.unwrap().phase(), ClaimPhase::Bound);
    }

    #[tokio::test]
    async fn test_claim_lost_when_volume_deleted() {
        let h = harness();
        h.create_volume(available("pv", 5)).await;
        let c = h.create_claim(Claim::new("ns", "c", 5, [RWO])).await;
        h.binder.sync_claim("ns/c").await.unwrap();

        h.stores.volumes.delete(&ObjectKey::cluster("pv")).await.unwrap();
        h.binder.caches().volumes.remove(&ObjectKey::cluster("pv"));
        let mut events = h.binder.subscribe();

        h.binder.sync_claim("ns/c").await.unwrap();
        assert_eq!(h.claim(&c).await.unwrap().phase(), ClaimPhase::Lost);
        assert_matches!(events.try_recv(), Ok(BinderEvent::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn test_admin_prebound_volume_becomes_available_then_binds() {
        let h = harness();
        let v = Volume::new("pv", 1, [RWO], ReclaimPolicy::Retain)
            .pre_bound_to(ClaimRef::new("ns", "c"));
        h.create_volume(v).await;
        h.binder.sync_volume("pv").await.unwrap();
        assert_eq!(h.volume("pv").await.unwrap().phase(), VolumePhase::Available);

        // Identity match bypasses the capacity check
        let c = h.create_claim(Claim::new("ns", "c", 100, [RWO])).await;
        h.binder.sync_claim("ns/c").await.unwrap();
        let v = h.volume("pv").await.unwrap();
        assert_eq!(v.phase(), VolumePhase::Bound);
        assert_eq!(v.spec.claim_ref.as_ref().unwrap().uid, c.metadata.uid);
        assert!(!v.markers.bound_by_controller);
    }

    #[tokio::test]
    async fn test_prebind_to_stale_uid_fails() {
        let h = harness();
        let v = Volume::new("pv", 1, [RWO], ReclaimPolicy::Retain).pre_bound_to(ClaimRef {
            namespace: "ns".into(),
            name: "ghost".into(),
            uid: "uid-that-never-was".into(),
        });
        h.create_volume(v).await;
        h.binder.sync_volume("pv").await.unwrap();
        let v = h.volume("pv").await.unwrap();
        assert_eq!(v.phase(), VolumePhase::Failed);
        assert!(v.status.message.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_deleted_claim_releases_retained_volume() {
        let h = harness();
        h.create_volume(available("pv", 5)).await;
        let c = h.create_claim(Claim::new("ns", "c", 5, [RWO])).await;
        h.binder.sync_claim("ns/c").await.unwrap();

        h.delete_claim(&c).await;
        h.binder.sync_volume("pv").await.unwrap();
        h.drain().await;

        let v = h.volume("pv").await.unwrap();
        assert_eq!(v.phase(), VolumePhase::Released);
        assert!(v.spec.claim_ref.is_some());
    }

    #[tokio::test]
    async fn test_cache_miss_is_confirmed_against_store() {
        let h = harness();
        h.create_volume(available("pv", 5)).await;
        let c = h.create_claim(Claim::new("ns", "c", 5, [RWO])).await;
        h.binder.sync_claim("ns/c").await.unwrap();

        // Informer lagging: claim missing from the cache only
        h.binder.caches().claims.remove(&c.key());
        h.binder.sync_volume("pv").await.unwrap();
        assert_eq!(h.volume("pv").await.unwrap().phase(), VolumePhase::Bound);
    }

    #[tokio::test]
    async fn test_controller_bound_volume_unbinds_when_claim_moved() {
        let h = harness();
        h.create_volume(available("a", 5)).await;
        let c = h.create_claim(Claim::new("ns", "c", 5, [RWO])).await;
        h.binder.sync_claim("ns/c").await.unwrap();

        // Claim rewritten to point elsewhere
        let mut moved = h.claim(&c).await.unwrap();
        moved.spec.volume_name = "b".into();
        let moved = h.stores.claims.update(moved).await.unwrap();
        h.binder.caches().claims.store_if_newer(moved);

        h.binder.sync_volume("a").await.unwrap();
        let a = h.volume("a").await.unwrap();
        assert!(a.spec.claim_ref.is_none());
        assert!(!a.markers.bound_by_controller);
        assert_eq!(a.phase(), VolumePhase::Available);
    }
}
