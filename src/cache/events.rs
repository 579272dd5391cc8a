//! Controller Events
//!
//! Typed change notifications flowing from the informers to the controller,
//! and the binder events broadcast to in-process observers.

use crate::domain::{Claim, ObjectKey, Resource, StorageClass, Volume, VolumePhase};
use serde::{Deserialize, Serialize};

// =============================================================================
// Informer Events
// =============================================================================

/// Change to one cached object
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(K),
    /// Periodic re-delivery of an unchanged object
    Resynced(K),
}

impl<K: Resource> ResourceEvent<K> {
    /// Latest known state of the object
    pub fn object(&self) -> &K {
        match self {
            ResourceEvent::Added(o)
            | ResourceEvent::Deleted(o)
            | ResourceEvent::Resynced(o)
            | ResourceEvent::Updated { new: o, .. } => o,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.object().key()
    }
}

/// Tagged union over every watched kind
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Volume(ResourceEvent<Volume>),
    Claim(ResourceEvent<Claim>),
    StorageClass(ResourceEvent<StorageClass>),
}

/// Kinds the controller watches
pub trait Watched: Resource {
    fn wrap(event: ResourceEvent<Self>) -> ControllerEvent;
}

impl Watched for Volume {
    fn wrap(event: ResourceEvent<Self>) -> ControllerEvent {
        ControllerEvent::Volume(event)
    }
}

impl Watched for Claim {
    fn wrap(event: ResourceEvent<Self>) -> ControllerEvent {
        ControllerEvent::Claim(event)
    }
}

impl Watched for StorageClass {
    fn wrap(event: ResourceEvent<Self>) -> ControllerEvent {
        ControllerEvent::StorageClass(event)
    }
}

// =============================================================================
// Binder Events
// =============================================================================

/// Events emitted by the binder for monitoring and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BinderEvent {
    /// Volume became eligible for binding
    VolumeAvailable { volume: String },

    /// Claim and volume reference each other
    Bound { claim: String, volume: String },

    /// Claim's volume disappeared or went to another claim
    ClaimLost { claim: String, volume: String },

    /// Claim was deleted; volume awaits reclaim
    VolumeReleased { volume: String, claim: String },

    VolumeFailed { volume: String, reason: String },

    /// New volume created for a claim
    Provisioned { claim: String, volume: String },

    ProvisioningFailed {
        claim: String,
        attempts: u32,
        reason: String,
    },

    /// Volume scrubbed and returned to the pool
    Recycled { volume: String },

    /// Volume object and asset destroyed
    VolumeDeleted { volume: String },

    ReclaimFailed { volume: String, reason: String },
}

impl BinderEvent {
    /// Volume this event concerns (if any)
    pub fn volume(&self) -> Option<&str> {
        match self {
            BinderEvent::VolumeAvailable { volume }
            | BinderEvent::Bound { volume, .. }
            | BinderEvent::ClaimLost { volume, .. }
            | BinderEvent::VolumeReleased { volume, .. }
            | BinderEvent::VolumeFailed { volume, .. }
            | BinderEvent::Provisioned { volume, .. }
            | BinderEvent::Recycled { volume }
            | BinderEvent::VolumeDeleted { volume }
            | BinderEvent::ReclaimFailed { volume, .. } => Some(volume),
            BinderEvent::ProvisioningFailed { .. } => None,
        }
    }

    /// Claim this event concerns (if any)
    pub fn claim(&self) -> Option<&str> {
        match self {
            BinderEvent::Bound { claim, .. }
            | BinderEvent::ClaimLost { claim, .. }
            | BinderEvent::VolumeReleased { claim, .. }
            | BinderEvent::Provisioned { claim, .. }
            | BinderEvent::ProvisioningFailed { claim, .. } => Some(claim),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            BinderEvent::VolumeFailed { .. }
                | BinderEvent::ProvisioningFailed { .. }
                | BinderEvent::ReclaimFailed { .. }
                | BinderEvent::ClaimLost { .. }
        )
    }

    /// Event matching a volume phase entered by the binder
    pub fn for_volume_phase(volume: &Volume) -> Option<Self> {
        let name = volume.metadata.name.clone();
        match volume.phase() {
            VolumePhase::Available => Some(BinderEvent::VolumeAvailable { volume: name }),
            VolumePhase::Released => Some(BinderEvent::VolumeReleased {
                volume: name,
                claim: volume
                    .spec
                    .claim_ref
                    .as_ref()
                    .map(|r| r.key().to_string())
                    .unwrap_or_default(),
            }),
            VolumePhase::Failed => Some(BinderEvent::VolumeFailed {
                volume: name,
                reason: volume.status.message.clone().unwrap_or_default(),
            }),
            VolumePhase::Pending | VolumePhase::Bound => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccessMode, ClaimRef, ReclaimPolicy};

    #[test]
    fn test_binder_event_accessors() {
        let bound = BinderEvent::Bound {
            claim: "ns/c".into(),
            volume: "pv".into(),
        };
        assert_eq!(bound.volume(), Some("pv"));
        assert_eq!(bound.claim(), Some("ns/c"));
        assert!(!bound.is_error());

        let failed = BinderEvent::ProvisioningFailed {
            claim: "ns/c".into(),
            attempts: 2,
            reason: "quota".into(),
        };
        assert_eq!(failed.volume(), None);
        assert!(failed.is_error());
    }

    #[test]
    fn test_event_for_released_volume() {
        let mut volume = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Retain)
            .pre_bound_to(ClaimRef::new("ns", "c"));
        volume.status.phase = VolumePhase::Released;
        assert_eq!(
            BinderEvent::for_volume_phase(&volume),
            Some(BinderEvent::VolumeReleased {
                volume: "pv".into(),
                claim: "ns/c".into()
            })
        );
    }

    #[test]
    fn test_controller_event_wrap() {
        let claim = Claim::new("ns", "c", 1, [AccessMode::ReadWriteOnce]);
        let event = Claim::wrap(ResourceEvent::Added(claim));
        assert!(matches!(event, ControllerEvent::Claim(ResourceEvent::Added(_))));
    }

    #[test]
    fn test_binder_event_serializes_tagged() {
        let json = serde_json::to_value(BinderEvent::Recycled { volume: "pv".into() }).unwrap();
        assert_eq!(json["type"], "recycled");
        assert_eq!(json["volume"], "pv");
    }
}
