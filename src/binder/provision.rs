//! Provisioning Trigger
//!
//! Creates a new volume for a claim nothing matched, through the plugin its
//! StorageClass names. The claim UID is the idempotency key: the volume is
//! always named `pvc-<uid>` and at most one call per claim is in flight.

use super::{claim_lock, Binder};
use crate::cache::BinderEvent;
use crate::domain::{
    Claim, ClaimRef, ObjectKey, ProvisionOptions, ProvisionedVolume, Resource, StorageClass,
    Volume, VolumeMarkers, VolumeSpec, VolumeStatus, ObjectMeta, VolumePhase,
};
use crate::error::{Error, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Name of the volume provisioned for `claim`
pub fn provisioned_volume_name(claim: &Claim) -> String {
    format!("pvc-{}", claim.metadata.uid)
}

/// Volume object describing a freshly created asset
///
/// Pre-bound to the claim and Pending until the plugin reports ready.
pub fn provisioned_volume(
    name: &str,
    claim: &Claim,
    class: &StorageClass,
    plugin: &str,
    asset: ProvisionedVolume,
) -> Volume {
    let mut metadata = ObjectMeta::named(name);
    metadata.labels = asset.labels;
    Volume {
        metadata,
        spec: VolumeSpec {
            capacity: asset.capacity.max(claim.spec.requested),
            access_modes: claim.spec.access_modes.clone(),
            reclaim_policy: class.reclaim_policy,
            claim_ref: Some(ClaimRef::to_claim(claim)),
            storage_class_name: class.metadata.name.clone(),
            source: Some(asset.source),
        },
        markers: VolumeMarkers {
            bound_by_controller: true,
            provisioned_by: Some(plugin.to_string()),
        },
        status: VolumeStatus {
            phase: VolumePhase::Pending,
            message: None,
        },
    }
}

impl Binder {
    /// Start provisioning for `claim` unless one is running, done or backing off
    ///
    /// Called with the claim lock held.
    pub(crate) async fn provision_claim(&self, claim: Claim, class: StorageClass) -> Result<()> {
        let key = claim.key().to_string();
        let state = claim.markers.provisioning.clone().unwrap_or_default();
        if state.exhausted {
            debug!(claim = %key, attempts = state.attempts, "provisioning attempts exhausted");
            return Ok(());
        }

        let volume_name = provisioned_volume_name(&claim);
        let volume_key = ObjectKey::cluster(&volume_name);
        if self.caches.volumes.contains(&volume_key) {
            debug!(claim = %key, volume = %volume_name, "volume already provisioned");
            return Ok(());
        }
        if let Some(existing) = self.stores.volumes.get(&volume_key).await? {
            self.caches.volumes.store_if_newer(existing);
            self.volume_queue.add(volume_name);
            return Ok(());
        }

        if state.attempts > 0 {
            if let Some(last) = state.last_attempt {
                let wait = self.config.provision_backoff(state.attempts);
                let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
                if elapsed < wait {
                    debug!(claim = %key, remaining_ms = (wait - elapsed).as_millis() as u64, "provisioning backing off");
                    self.claim_queue.add_after(key, wait - elapsed);
                    return Ok(());
                }
            }
        }

        let uid = claim.metadata.uid.clone();
        if !self.provisioning.insert(uid.clone()) {
            debug!(claim = %key, "provisioning already in flight");
            return Ok(());
        }

        let binder = self.clone();
        self.tasks.spawn(async move {
            binder.run_provisioning(claim, class, volume_name).await;
            binder.provisioning.remove(&uid);
        });
        Ok(())
    }

    async fn run_provisioning(&self, claim: Claim, class: StorageClass, volume_name: String) {
        let key = claim.key().to_string();
        let plugin = match self.plugins.get(&class.provisioner) {
            Some(p) => p,
            None => {
                let err = Error::ProvisionerNotFound {
                    provisioner: class.provisioner.clone(),
                };
                self.record_provisioning_failure(&claim, err).await;
                return;
            }
        };

        info!(
            claim = %key,
            class = %class.metadata.name,
            plugin = %plugin.name(),
            volume = %volume_name,
            "provisioning volume"
        );
        let options = ProvisionOptions::for_claim(volume_name.clone(), &claim, &class);
        let asset = match plugin.provision(&options).await {
            Ok(asset) => asset,
            Err(e) => {
                self.record_provisioning_failure(&claim, e).await;
                return;
            }
        };

        let volume = provisioned_volume(&volume_name, &claim, &class, plugin.name(), asset);
        match self.stores.volumes.create(volume.clone()).await {
            Ok(created) => {
                self.caches.volumes.store_if_newer(created);
            }
            Err(e) if e.is_already_exists() => {
                debug!(volume = %volume_name, "volume object already exists");
            }
            Err(e) => {
                // Do not leak the asset we just created
                if let Err(cleanup) = plugin.delete(&volume).await {
                    warn!(volume = %volume_name, error = %cleanup, "failed to delete orphaned asset");
                }
                self.record_provisioning_failure(&claim, e).await;
                return;
            }
        }

        info!(claim = %key, volume = %volume_name, "volume provisioned");
        self.metrics.provisioning.with_label_values(&["success"]).inc();
        self.emit(BinderEvent::Provisioned {
            claim: key.clone(),
            volume: volume_name.clone(),
        });
        if claim.markers.provisioning.is_some() {
            self.clear_provisioning_state(&claim).await;
        }
        self.volume_queue.add(volume_name);
        self.claim_queue.add(key);
    }

    async fn clear_provisioning_state(&self, claim: &Claim) {
        let key = claim.key().to_string();
        let _guard = self.locks.lock(&claim_lock(&key)).await;
        let current = match self.refresh_claim(&claim.key()).await {
            Ok(Some(c)) if c.metadata.uid == claim.metadata.uid => c,
            Ok(_) => return,
            Err(e) => {
                debug!(claim = %key, error = %e, "could not reload claim");
                return;
            }
        };
        if current.markers.provisioning.is_none() {
            return;
        }
        let mut updated = current;
        updated.markers.provisioning = None;
        if let Err(e) = self.update_claim(updated).await {
            debug!(claim = %key, error = %e, "could not clear provisioning state");
        }
    }

    /// Persist the failure on the claim and schedule the next attempt
    async fn record_provisioning_failure(&self, claim: &Claim, err: Error) {
        let key = claim.key().to_string();
        let reason = err.to_string();
        let _guard = self.locks.lock(&claim_lock(&key)).await;

        let current = match self.refresh_claim(&claim.key()).await {
            Ok(Some(c)) if c.metadata.uid == claim.metadata.uid => c,
            Ok(_) => {
                debug!(claim = %key, "claim deleted while provisioning");
                return;
            }
            Err(e) => {
                warn!(claim = %key, error = %e, "could not reload claim after provisioning failure");
                self.claim_queue.add_rate_limited(key);
                return;
            }
        };

        let mut updated = current;
        let state = updated.markers.provisioning.get_or_insert_with(Default::default);
        state.attempts = state.attempts.saturating_add(1);
        state.last_failure = Some(reason.clone());
        state.last_attempt = Some(Utc::now());
        state.exhausted = state.attempts >= self.config.provision_max_attempts;
        let attempts = state.attempts;
        let exhausted = state.exhausted;

        warn!(claim = %key, attempts, exhausted, error = %reason, "provisioning failed");
        self.metrics
            .provisioning
            .with_label_values(&[if exhausted { "exhausted" } else { "failure" }])
            .inc();
        self.emit(BinderEvent::ProvisioningFailed {
            claim: key.clone(),
            attempts,
            reason,
        });

        if let Err(e) = self.update_claim(updated).await {
            warn!(claim = %key, error = %e, "could not record provisioning failure");
            self.claim_queue.add_rate_limited(key);
            return;
        }
        if !exhausted {
            self.claim_queue
                .add_after(key, self.config.provision_backoff(attempts));
        }
    }
}
