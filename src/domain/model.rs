//! Domain Model
//!
//! Volumes, claims and storage classes as the binder sees them, plus the
//! typed markers that record binder decisions durably on each object.

use super::selector::LabelSelector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Object Metadata
// =============================================================================

/// Identity and bookkeeping shared by every stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Only claims are namespaced
    #[serde(default)]
    pub namespace: Option<String>,
    /// Assigned by the store on create
    #[serde(default)]
    pub uid: String,
    /// Version token used for optimistic concurrency
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Free-form annotations owned by users; the binder never reads them
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

/// Key addressing an object in the store and in local caches
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Parse `ns/name` or `name`
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::namespaced(ns, name),
            None => Self::cluster(s),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Resource Trait
// =============================================================================

/// Common behaviour of every object kind held by the store
pub trait Resource: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static {
    /// Kind name used in errors and logs
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Copy the status half of `other` into `self`
    ///
    /// The store uses this to keep the main and status-only write paths
    /// from clobbering each other.
    fn copy_status_from(&mut self, other: &Self);

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey {
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn resource_version(&self) -> &str {
        &self.meta().resource_version
    }
}

// =============================================================================
// Enumerations
// =============================================================================

/// How a volume can be mounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadWriteOnce => write!(f, "ReadWriteOnce"),
            AccessMode::ReadOnlyMany => write!(f, "ReadOnlyMany"),
            AccessMode::ReadWriteMany => write!(f, "ReadWriteMany"),
            AccessMode::ReadWriteOncePod => write!(f, "ReadWriteOncePod"),
        }
    }
}

impl std::str::FromStr for AccessMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "ReadWriteOnce" => Ok(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" => Ok(AccessMode::ReadOnlyMany),
            "ReadWriteMany" => Ok(AccessMode::ReadWriteMany),
            "ReadWriteOncePod" => Ok(AccessMode::ReadWriteOncePod),
            other => Err(crate::error::Error::Configuration(format!(
                "unknown access mode {:?}",
                other
            ))),
        }
    }
}

/// What happens to a volume once its claim is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    #[default]
    Retain,
    Recycle,
    Delete,
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimPolicy::Retain => write!(f, "Retain"),
            ReclaimPolicy::Recycle => write!(f, "Recycle"),
            ReclaimPolicy::Delete => write!(f, "Delete"),
        }
    }
}

impl std::str::FromStr for ReclaimPolicy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "Retain" => Ok(ReclaimPolicy::Retain),
            "Recycle" => Ok(ReclaimPolicy::Recycle),
            "Delete" => Ok(ReclaimPolicy::Delete),
            other => Err(crate::error::Error::Configuration(format!(
                "unknown reclaim policy {:?}",
                other
            ))),
        }
    }
}

/// Volume lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumePhase {
    #[default]
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Pending => write!(f, "Pending"),
            VolumePhase::Available => write!(f, "Available"),
            VolumePhase::Bound => write!(f, "Bound"),
            VolumePhase::Released => write!(f, "Released"),
            VolumePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Claim lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
            ClaimPhase::Lost => write!(f, "Lost"),
        }
    }
}

// =============================================================================
// Volume
// =============================================================================

/// Reference from a volume to the claim it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
    /// Empty while an administrator pre-bind waits for its claim
    #[serde(default)]
    pub uid: String,
}

impl ClaimRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: String::new(),
        }
    }

    /// Full reference to an existing claim
    pub fn to_claim(claim: &Claim) -> Self {
        Self {
            namespace: claim.metadata.namespace.clone().unwrap_or_default(),
            name: claim.metadata.name.clone(),
            uid: claim.metadata.uid.clone(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(self.namespace.clone(), self.name.clone())
    }

    /// Same namespace and name, regardless of UID
    pub fn names(&self, claim: &Claim) -> bool {
        claim.metadata.namespace.as_deref() == Some(self.namespace.as_str())
            && claim.metadata.name == self.name
    }

    /// Names this claim and, when a UID is recorded, the same incarnation
    pub fn refers_to(&self, claim: &Claim) -> bool {
        self.names(claim) && (self.uid.is_empty() || self.uid == claim.metadata.uid)
    }
}

/// Where the volume's data physically lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Directory on a host
    HostPath { path: String },
    /// Asset managed by an external driver
    External { driver: String, handle: String },
}

/// Binder decisions persisted on a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMarkers {
    /// The claim reference was written by the controller, not an administrator
    #[serde(default)]
    pub bound_by_controller: bool,
    /// Plugin that created the underlying asset
    #[serde(default)]
    pub provisioned_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Capacity in bytes
    pub capacity: u64,
    pub access_modes: BTreeSet<AccessMode>,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,
    /// Empty string means no class
    #[serde(default)]
    pub storage_class_name: String,
    #[serde(default)]
    pub source: Option<VolumeSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    #[serde(default)]
    pub phase: VolumePhase,
    #[serde(default)]
    pub message: Option<String>,
}

/// Administrator-declared unit of storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub metadata: ObjectMeta,
    pub spec: VolumeSpec,
    #[serde(default)]
    pub markers: VolumeMarkers,
    #[serde(default)]
    pub status: VolumeStatus,
}

impl Volume {
    /// New unbound volume
    pub fn new(
        name: impl Into<String>,
        capacity: u64,
        access_modes: impl IntoIterator<Item = AccessMode>,
        reclaim_policy: ReclaimPolicy,
    ) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: VolumeSpec {
                capacity,
                access_modes: access_modes.into_iter().collect(),
                reclaim_policy,
                ..Default::default()
            },
            markers: VolumeMarkers::default(),
            status: VolumeStatus::default(),
        }
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.spec.storage_class_name = class.into();
        self
    }

    pub fn with_source(mut self, source: VolumeSource) -> Self {
        self.spec.source = Some(source);
        self
    }

    /// Administrator pre-bind to a claim that may not exist yet
    pub fn pre_bound_to(mut self, claim_ref: ClaimRef) -> Self {
        self.spec.claim_ref = Some(claim_ref);
        self
    }

    pub fn phase(&self) -> VolumePhase {
        self.status.phase
    }

    pub fn is_bound_to(&self, claim: &Claim) -> bool {
        self.spec
            .claim_ref
            .as_ref()
            .map_or(false, |r| r.refers_to(claim))
    }
}

impl Resource for Volume {
    const KIND: &'static str = "Volume";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

// =============================================================================
// Claim
// =============================================================================

/// Storage class a claim asks for
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageClassRequest {
    /// Field not set; resolves to the configured default class
    #[default]
    Unset,
    /// Explicitly no class
    Empty,
    Named(String),
}

impl StorageClassRequest {
    pub fn from_option(class: Option<&str>) -> Self {
        match class {
            None => StorageClassRequest::Unset,
            Some("") => StorageClassRequest::Empty,
            Some(name) => StorageClassRequest::Named(name.to_string()),
        }
    }

    pub fn as_option(&self) -> Option<&str> {
        match self {
            StorageClassRequest::Unset => None,
            StorageClassRequest::Empty => Some(""),
            StorageClassRequest::Named(name) => Some(name),
        }
    }

    /// Class name volumes must carry, after default resolution
    pub fn resolve<'a>(&'a self, default_class: Option<&'a str>) -> &'a str {
        match self {
            StorageClassRequest::Unset => default_class.unwrap_or(""),
            StorageClassRequest::Empty => "",
            StorageClassRequest::Named(name) => name,
        }
    }
}

/// Provisioning bookkeeping for a claim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningState {
    pub attempts: u32,
    #[serde(default)]
    pub last_failure: Option<String>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Attempts ran out; no further automatic retries
    #[serde(default)]
    pub exhausted: bool,
}

/// Binder decisions persisted on a claim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMarkers {
    /// Binding finished; never re-match this claim
    #[serde(default)]
    pub bind_completed: bool,
    /// The volume name was written by the controller, not the user
    #[serde(default)]
    pub bound_by_controller: bool,
    #[serde(default)]
    pub provisioning: Option<ProvisioningState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    /// Requested capacity in bytes (lower bound)
    pub requested: u64,
    pub access_modes: BTreeSet<AccessMode>,
    #[serde(default)]
    pub selector: Option<LabelSelector>,
    #[serde(default)]
    pub storage_class: StorageClassRequest,
    /// Empty until bound
    #[serde(default)]
    pub volume_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
    /// Capacity of the bound volume
    #[serde(default)]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub access_modes: BTreeSet<AccessMode>,
}

/// User request for storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub metadata: ObjectMeta,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub markers: ClaimMarkers,
    #[serde(default)]
    pub status: ClaimStatus,
}

impl Claim {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        requested: u64,
        access_modes: impl IntoIterator<Item = AccessMode>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: ClaimSpec {
                requested,
                access_modes: access_modes.into_iter().collect(),
                ..Default::default()
            },
            markers: ClaimMarkers::default(),
            status: ClaimStatus::default(),
        }
    }

    pub fn with_class(mut self, class: StorageClassRequest) -> Self {
        self.spec.storage_class = class;
        self
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.spec.selector = Some(selector);
        self
    }

    /// User pre-bind to a specific volume
    pub fn with_volume_name(mut self, volume: impl Into<String>) -> Self {
        self.spec.volume_name = volume.into();
        self
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn phase(&self) -> ClaimPhase {
        self.status.phase
    }

    pub fn is_unbound(&self) -> bool {
        self.spec.volume_name.is_empty()
    }
}

impl Resource for Claim {
    const KIND: &'static str = "Claim";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

// =============================================================================
// Storage Class
// =============================================================================

/// Named provisioning profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClass {
    pub metadata: ObjectMeta,
    /// Identifier of the provisioning capability
    pub provisioner: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Policy given to provisioned volumes
    #[serde(default = "default_class_reclaim_policy")]
    pub reclaim_policy: ReclaimPolicy,
}

fn default_class_reclaim_policy() -> ReclaimPolicy {
    ReclaimPolicy::Delete
}

impl StorageClass {
    pub fn new(name: impl Into<String>, provisioner: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            provisioner: provisioner.into(),
            parameters: BTreeMap::new(),
            reclaim_policy: ReclaimPolicy::Delete,
        }
    }
}

impl Resource for StorageClass {
    const KIND: &'static str = "StorageClass";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status_from(&mut self, _other: &Self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_with_uid(uid: &str) -> Claim {
        let mut claim = Claim::new("ns", "data", 1, [AccessMode::ReadWriteOnce]);
        claim.metadata.uid = uid.to_string();
        claim
    }

    #[test]
    fn test_claim_ref_identity() {
        let claim = claim_with_uid("uid-1");

        let pre_bind = ClaimRef::new("ns", "data");
        assert!(pre_bind.refers_to(&claim));

        let full = ClaimRef::to_claim(&claim);
        assert_eq!(full.uid, "uid-1");
        assert!(full.refers_to(&claim));

        // Same name, different incarnation
        let stale = ClaimRef {
            uid: "uid-0".into(),
            ..full.clone()
        };
        assert!(stale.names(&claim));
        assert!(!stale.refers_to(&claim));

        let other_ns = ClaimRef::new("other", "data");
        assert!(!other_ns.refers_to(&claim));
    }

    #[test]
    fn test_storage_class_tri_state() {
        assert_eq!(StorageClassRequest::from_option(None), StorageClassRequest::Unset);
        assert_eq!(StorageClassRequest::from_option(Some("")), StorageClassRequest::Empty);
        assert_eq!(
            StorageClassRequest::from_option(Some("gold")),
            StorageClassRequest::Named("gold".into())
        );

        assert_eq!(StorageClassRequest::Unset.resolve(Some("standard")), "standard");
        assert_eq!(StorageClassRequest::Unset.resolve(None), "");
        assert_eq!(StorageClassRequest::Empty.resolve(Some("standard")), "");
        assert_eq!(
            StorageClassRequest::Named("gold".into()).resolve(Some("standard")),
            "gold"
        );
    }

    #[test]
    fn test_object_key_display_and_parse() {
        let key = ObjectKey::namespaced("ns", "claim");
        assert_eq!(key.to_string(), "ns/claim");
        assert_eq!(ObjectKey::parse("ns/claim"), key);
        assert_eq!(ObjectKey::parse("pv-1"), ObjectKey::cluster("pv-1"));
    }

    #[test]
    fn test_enum_parse() {
        assert_eq!("ReadWriteMany".parse::<AccessMode>().unwrap(), AccessMode::ReadWriteMany);
        assert_eq!("Recycle".parse::<ReclaimPolicy>().unwrap(), ReclaimPolicy::Recycle);
        assert!("Destroy".parse::<ReclaimPolicy>().is_err());
    }

    #[test]
    fn test_copy_status_from() {
        let mut a = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Retain);
        let mut b = a.clone();
        b.status.phase = VolumePhase::Bound;
        b.spec.capacity = 99;
        a.copy_status_from(&b);
        assert_eq!(a.phase(), VolumePhase::Bound);
        assert_eq!(a.spec.capacity, 1);
    }
}
