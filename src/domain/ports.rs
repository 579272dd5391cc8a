//! Domain Ports - Core trait definitions for the volume binder
//!
//! These traits define the boundaries between the binder and external systems.
//! Adapters implement these traits to provide concrete functionality.

use super::model::{AccessMode, Claim, ObjectKey, Resource, StorageClass, Volume, VolumeSource};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Object Store Port
// =============================================================================

/// Snapshot returned by a list call
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    /// Store version the snapshot was taken at; watch from here
    pub resource_version: String,
}

/// Ordered change notification for one object kind
///
/// Each variant carries the object's state after the change (for deletes,
/// the last known state).
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K: Resource> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Port for a watchable, versioned object store
///
/// Every write is a compare-and-swap on `resource_version`: a write carrying
/// a version other than the stored one fails with `Error::Conflict`.
#[async_trait]
pub trait ResourceStore<K: Resource>: Send + Sync {
    /// Fetch one object
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// List all objects of this kind
    async fn list(&self) -> Result<ObjectList<K>>;

    /// Create an object; the store assigns UID, version and timestamp
    async fn create(&self, object: K) -> Result<K>;

    /// Replace everything but status
    async fn update(&self, object: K) -> Result<K>;

    /// Replace status only
    async fn update_status(&self, object: K) -> Result<K>;

    /// Delete an object
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Stream changes strictly after `resource_version`
    ///
    /// The stream yields `Error::Expired` when the version is too old to
    /// replay; the caller must relist.
    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>>;

    /// Backend name for logs
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Volume Plugin Port
// =============================================================================

/// Parameters handed to a plugin when creating a new asset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionOptions {
    /// Name the new volume object will carry
    pub volume_name: String,
    /// Claim the asset is for, as `namespace/name`
    pub claim: String,
    pub claim_uid: String,
    pub capacity: u64,
    pub access_modes: BTreeSet<AccessMode>,
    pub storage_class: String,
    /// StorageClass parameters, passed through opaquely
    pub parameters: BTreeMap<String, String>,
}

impl ProvisionOptions {
    pub fn for_claim(volume_name: String, claim: &Claim, class: &StorageClass) -> Self {
        Self {
            volume_name,
            claim: claim.key().to_string(),
            claim_uid: claim.metadata.uid.clone(),
            capacity: claim.spec.requested,
            access_modes: claim.spec.access_modes.clone(),
            storage_class: class.metadata.name.clone(),
            parameters: class.parameters.clone(),
        }
    }
}

/// Asset created by a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedVolume {
    pub source: VolumeSource,
    /// Actual capacity, at least the requested one
    pub capacity: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Port for the capability that creates, scrubs and destroys assets
///
/// Plugins that cannot perform an operation return `Error::Unsupported`.
#[async_trait]
pub trait VolumePlugin: Send + Sync {
    /// Plugin name; StorageClasses select it through their provisioner field
    fn name(&self) -> &str;

    /// Whether this plugin manages assets of this kind
    fn supports(&self, source: &VolumeSource) -> bool;

    /// Create a new asset
    async fn provision(&self, options: &ProvisionOptions) -> Result<ProvisionedVolume>;

    /// Whether a provisioned asset is ready for use
    async fn is_ready(&self, volume: &Volume) -> Result<bool>;

    /// Destroy the asset behind a volume
    async fn delete(&self, volume: &Volume) -> Result<()>;

    /// Scrub the asset so the volume can be reused
    async fn recycle(&self, volume: &Volume) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceStoreRef<K> = Arc<dyn ResourceStore<K>>;
pub type VolumePluginRef = Arc<dyn VolumePlugin>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_options_from_claim() {
        let mut claim = Claim::new("ns", "data", 5, [AccessMode::ReadWriteOnce]);
        claim.metadata.uid = "uid-7".into();
        let mut class = StorageClass::new("gold", "host-path");
        class.parameters.insert("tier".into(), "fast".into());

        let opts = ProvisionOptions::for_claim("pvc-uid-7".into(), &claim, &class);
        assert_eq!(opts.claim, "ns/data");
        assert_eq!(opts.claim_uid, "uid-7");
        assert_eq!(opts.capacity, 5);
        assert_eq!(opts.storage_class, "gold");
        assert_eq!(opts.parameters.get("tier").map(String::as_str), Some("fast"));
    }

    #[test]
    fn test_watch_event_object() {
        let volume = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], Default::default());
        let event = WatchEvent::Deleted(volume.clone());
        assert_eq!(event.object().name(), "pv");
        assert_eq!(event.into_object(), volume);
    }
}
