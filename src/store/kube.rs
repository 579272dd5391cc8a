//! Kubernetes Object Store Adapter
//!
//! Implements [`ResourceStore`] over a Kubernetes API server, mapping
//! PersistentVolume, PersistentVolumeClaim and StorageClass objects to the
//! binder's model. Typed binder markers travel as annotations.

use crate::domain::{
    parse_quantity, format_quantity, AccessMode, Claim, ClaimMarkers, ClaimPhase, ClaimRef,
    ClaimSpec, ClaimStatus, LabelSelector, LabelSelectorRequirement, ObjectKey, ObjectList,
    ObjectMeta, ProvisioningState, ReclaimPolicy, Resource, ResourceStore, StorageClass,
    StorageClassRequest, Volume, VolumeMarkers, VolumePhase, VolumeSource, VolumeSpec,
    VolumeStatus, WatchEvent,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, HostPathVolumeSource, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeSpec, PersistentVolumeStatus, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass as KubeStorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchParams};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::Client;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::str::FromStr;
use tracing::{debug, warn};

// =============================================================================
// Marker Annotations
// =============================================================================

pub const ANN_BIND_COMPLETED: &str = "pv.kubernetes.io/bind-completed";
pub const ANN_BOUND_BY_CONTROLLER: &str = "pv.kubernetes.io/bound-by-controller";
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";
pub const ANN_PROVISION_ATTEMPTS: &str = "volume-binder.io/provision-attempts";
pub const ANN_PROVISION_FAILURE: &str = "volume-binder.io/provision-failure";
pub const ANN_PROVISION_LAST_ATTEMPT: &str = "volume-binder.io/provision-last-attempt";
pub const ANN_PROVISION_EXHAUSTED: &str = "volume-binder.io/provision-exhausted";

const MARKER_ANNOTATIONS: [&str; 7] = [
    ANN_BIND_COMPLETED,
    ANN_BOUND_BY_CONTROLLER,
    ANN_PROVISIONED_BY,
    ANN_PROVISION_ATTEMPTS,
    ANN_PROVISION_FAILURE,
    ANN_PROVISION_LAST_ATTEMPT,
    ANN_PROVISION_EXHAUSTED,
];

const STORAGE: &str = "storage";
const YES: &str = "yes";

// =============================================================================
// Mapping Trait
// =============================================================================

/// Conversion between a binder object and its Kubernetes counterpart
pub trait KubeMapped: Resource + Sized {
    type Kube: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Api handle scoped for one object (namespaced kinds need the namespace)
    fn api(client: Client, namespace: Option<&str>) -> Api<Self::Kube>;

    fn from_kube(object: Self::Kube) -> Result<Self>;

    fn to_kube(&self) -> Self::Kube;
}

fn meta_from_kube(m: meta::ObjectMeta) -> (ObjectMeta, BTreeMap<String, String>) {
    let mut annotations = m.annotations.unwrap_or_default();
    let markers: BTreeMap<String, String> = MARKER_ANNOTATIONS
        .iter()
        .filter_map(|k| annotations.remove(*k).map(|v| (k.to_string(), v)))
        .collect();
    let object = ObjectMeta {
        name: m.name.unwrap_or_default(),
        namespace: m.namespace,
        uid: m.uid.unwrap_or_default(),
        resource_version: m.resource_version.unwrap_or_default(),
        creation_timestamp: m.creation_timestamp.map(|t| t.0),
        labels: m.labels.unwrap_or_default(),
        annotations,
    };
    (object, markers)
}

fn meta_to_kube(m: &ObjectMeta, markers: BTreeMap<String, String>) -> meta::ObjectMeta {
    let mut annotations = m.annotations.clone();
    annotations.extend(markers);
    meta::ObjectMeta {
        name: Some(m.name.clone()),
        namespace: m.namespace.clone(),
        uid: non_empty(&m.uid),
        resource_version: non_empty(&m.resource_version),
        labels: (!m.labels.is_empty()).then(|| m.labels.clone()),
        annotations: (!annotations.is_empty()).then_some(annotations),
        ..Default::default()
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn invalid(kind: &str, name: &str, reason: impl Into<String>) -> Error {
    Error::InvalidObject {
        kind: kind.to_string(),
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn storage_quantity(map: Option<&BTreeMap<String, Quantity>>) -> Result<Option<u64>> {
    map.and_then(|m| m.get(STORAGE))
        .map(|q| parse_quantity(&q.0))
        .transpose()
}

fn storage_map(bytes: u64) -> BTreeMap<String, Quantity> {
    BTreeMap::from([(STORAGE.to_string(), Quantity(format_quantity(bytes)))])
}

fn modes_from_kube(modes: Option<Vec<String>>) -> Result<std::collections::BTreeSet<AccessMode>> {
    modes
        .unwrap_or_default()
        .iter()
        .map(|m| AccessMode::from_str(m))
        .collect()
}

fn modes_to_kube(modes: &std::collections::BTreeSet<AccessMode>) -> Option<Vec<String>> {
    (!modes.is_empty()).then(|| modes.iter().map(ToString::to_string).collect())
}

fn flag(markers: &BTreeMap<String, String>, key: &str) -> bool {
    markers.get(key).map_or(false, |v| v == YES)
}

// =============================================================================
// Volume <-> PersistentVolume
// =============================================================================

fn volume_phase(phase: Option<&str>) -> VolumePhase {
    match phase {
        Some("Available") => VolumePhase::Available,
        Some("Bound") => VolumePhase::Bound,
        Some("Released") => VolumePhase::Released,
        Some("Failed") => VolumePhase::Failed,
        _ => VolumePhase::Pending,
    }
}

impl KubeMapped for Volume {
    type Kube = PersistentVolume;

    fn api(client: Client, _namespace: Option<&str>) -> Api<PersistentVolume> {
        Api::all(client)
    }

    fn from_kube(pv: PersistentVolume) -> Result<Self> {
        let (metadata, markers) = meta_from_kube(pv.metadata);
        let name = metadata.name.clone();
        let spec = pv.spec.unwrap_or_default();

        let capacity = storage_quantity(spec.capacity.as_ref())?
            .ok_or_else(|| invalid(Volume::KIND, &name, "missing storage capacity"))?;
        let reclaim_policy = spec
            .persistent_volume_reclaim_policy
            .as_deref()
            .map(ReclaimPolicy::from_str)
            .transpose()?
            .unwrap_or_default();
        let claim_ref = spec.claim_ref.map(|r| ClaimRef {
            namespace: r.namespace.unwrap_or_default(),
            name: r.name.unwrap_or_default(),
            uid: r.uid.unwrap_or_default(),
        });
        let source = if let Some(hp) = spec.host_path {
            Some(VolumeSource::HostPath { path: hp.path })
        } else {
            spec.csi.map(|csi| VolumeSource::External {
                driver: csi.driver,
                handle: csi.volume_handle,
            })
        };

        let status = pv.status.unwrap_or_default();
        Ok(Volume {
            metadata,
            spec: VolumeSpec {
                capacity,
                access_modes: modes_from_kube(spec.access_modes)?,
                reclaim_policy,
                claim_ref,
                storage_class_name: spec.storage_class_name.unwrap_or_default(),
                source,
            },
            markers: VolumeMarkers {
                bound_by_controller: flag(&markers, ANN_BOUND_BY_CONTROLLER),
                provisioned_by: markers.get(ANN_PROVISIONED_BY).cloned(),
            },
            status: VolumeStatus {
                phase: volume_phase(status.phase.as_deref()),
                message: status.message,
            },
        })
    }

    fn to_kube(&self) -> PersistentVolume {
        let mut markers = BTreeMap::new();
        if self.markers.bound_by_controller {
            markers.insert(ANN_BOUND_BY_CONTROLLER.to_string(), YES.to_string());
        }
        if let Some(plugin) = &self.markers.provisioned_by {
            markers.insert(ANN_PROVISIONED_BY.to_string(), plugin.clone());
        }

        let (host_path, csi) = match &self.spec.source {
            Some(VolumeSource::HostPath { path }) => (
                Some(HostPathVolumeSource {
                    path: path.clone(),
                    ..Default::default()
                }),
                None,
            ),
            Some(VolumeSource::External { driver, handle }) => (
                None,
                Some(CSIPersistentVolumeSource {
                    driver: driver.clone(),
                    volume_handle: handle.clone(),
                    ..Default::default()
                }),
            ),
            None => (None, None),
        };

        PersistentVolume {
            metadata: meta_to_kube(&self.metadata, markers),
            spec: Some(PersistentVolumeSpec {
                capacity: Some(storage_map(self.spec.capacity)),
                access_modes: modes_to_kube(&self.spec.access_modes),
                persistent_volume_reclaim_policy: Some(self.spec.reclaim_policy.to_string()),
                claim_ref: self.spec.claim_ref.as_ref().map(|r| ObjectReference {
                    kind: Some("PersistentVolumeClaim".to_string()),
                    api_version: Some("v1".to_string()),
                    namespace: Some(r.namespace.clone()),
                    name: Some(r.name.clone()),
                    uid: non_empty(&r.uid),
                    ..Default::default()
                }),
                storage_class_name: non_empty(&self.spec.storage_class_name),
                host_path,
                csi,
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some(self.status.phase.to_string()),
                message: self.status.message.clone(),
                ..Default::default()
            }),
        }
    }
}

// =============================================================================
// Claim <-> PersistentVolumeClaim
// =============================================================================

fn claim_phase(phase: Option<&str>) -> ClaimPhase {
    match phase {
        Some("Bound") => ClaimPhase::Bound,
        Some("Lost") => ClaimPhase::Lost,
        _ => ClaimPhase::Pending,
    }
}

fn selector_from_kube(s: meta::LabelSelector) -> Result<LabelSelector> {
    let match_expressions = s
        .match_expressions
        .unwrap_or_default()
        .into_iter()
        .map(|r| {
            Ok(LabelSelectorRequirement {
                key: r.key,
                operator: r.operator.parse()?,
                values: r.values.unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LabelSelector {
        match_labels: s.match_labels.unwrap_or_default(),
        match_expressions,
    })
}

fn selector_to_kube(s: &LabelSelector) -> meta::LabelSelector {
    meta::LabelSelector {
        match_labels: (!s.match_labels.is_empty()).then(|| s.match_labels.clone()),
        match_expressions: (!s.match_expressions.is_empty()).then(|| {
            s.match_expressions
                .iter()
                .map(|r| meta::LabelSelectorRequirement {
                    key: r.key.clone(),
                    operator: r.operator.to_string(),
                    values: (!r.values.is_empty()).then(|| r.values.clone()),
                })
                .collect()
        }),
    }
}

fn provisioning_from_markers(markers: &BTreeMap<String, String>) -> Option<ProvisioningState> {
    let attempts = markers.get(ANN_PROVISION_ATTEMPTS)?.parse().ok()?;
    Some(ProvisioningState {
        attempts,
        last_failure: markers.get(ANN_PROVISION_FAILURE).cloned(),
        last_attempt: markers
            .get(ANN_PROVISION_LAST_ATTEMPT)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc)),
        exhausted: flag(markers, ANN_PROVISION_EXHAUSTED),
    })
}

impl KubeMapped for Claim {
    type Kube = PersistentVolumeClaim;

    fn api(client: Client, namespace: Option<&str>) -> Api<PersistentVolumeClaim> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }

    fn from_kube(pvc: PersistentVolumeClaim) -> Result<Self> {
        let (metadata, markers) = meta_from_kube(pvc.metadata);
        let name = metadata.name.clone();
        let spec = pvc.spec.unwrap_or_default();

        let requested = storage_quantity(
            spec.resources
                .as_ref()
                .and_then(|r| r.requests.as_ref()),
        )?
        .ok_or_else(|| invalid(Claim::KIND, &name, "missing storage request"))?;

        let status = pvc.status.unwrap_or_default();
        Ok(Claim {
            metadata,
            spec: ClaimSpec {
                requested,
                access_modes: modes_from_kube(spec.access_modes)?,
                selector: spec.selector.map(selector_from_kube).transpose()?,
                storage_class: StorageClassRequest::from_option(spec.storage_class_name.as_deref()),
                volume_name: spec.volume_name.unwrap_or_default(),
            },
            markers: ClaimMarkers {
                bind_completed: flag(&markers, ANN_BIND_COMPLETED),
                bound_by_controller: flag(&markers, ANN_BOUND_BY_CONTROLLER),
                provisioning: provisioning_from_markers(&markers),
            },
            status: ClaimStatus {
                phase: claim_phase(status.phase.as_deref()),
                capacity: storage_quantity(status.capacity.as_ref())?,
                access_modes: modes_from_kube(status.access_modes)?,
            },
        })
    }

    fn to_kube(&self) -> PersistentVolumeClaim {
        let mut markers = BTreeMap::new();
        if self.markers.bind_completed {
            markers.insert(ANN_BIND_COMPLETED.to_string(), YES.to_string());
        }
        if self.markers.bound_by_controller {
            markers.insert(ANN_BOUND_BY_CONTROLLER.to_string(), YES.to_string());
        }
        if let Some(p) = &self.markers.provisioning {
            markers.insert(ANN_PROVISION_ATTEMPTS.to_string(), p.attempts.to_string());
            if let Some(failure) = &p.last_failure {
                markers.insert(ANN_PROVISION_FAILURE.to_string(), failure.clone());
            }
            if let Some(at) = p.last_attempt {
                markers.insert(ANN_PROVISION_LAST_ATTEMPT.to_string(), at.to_rfc3339());
            }
            if p.exhausted {
                markers.insert(ANN_PROVISION_EXHAUSTED.to_string(), YES.to_string());
            }
        }

        PersistentVolumeClaim {
            metadata: meta_to_kube(&self.metadata, markers),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: modes_to_kube(&self.spec.access_modes),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(storage_map(self.spec.requested)),
                    ..Default::default()
                }),
                selector: self.spec.selector.as_ref().map(selector_to_kube),
                storage_class_name: self.spec.storage_class.as_option().map(str::to_string),
                volume_name: non_empty(&self.spec.volume_name),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(self.status.phase.to_string()),
                capacity: self.status.capacity.map(storage_map),
                access_modes: modes_to_kube(&self.status.access_modes),
                ..Default::default()
            }),
        }
    }
}

// =============================================================================
// StorageClass
// =============================================================================

impl KubeMapped for StorageClass {
    type Kube = KubeStorageClass;

    fn api(client: Client, _namespace: Option<&str>) -> Api<KubeStorageClass> {
        Api::all(client)
    }

    fn from_kube(sc: KubeStorageClass) -> Result<Self> {
        let (metadata, _) = meta_from_kube(sc.metadata);
        Ok(StorageClass {
            metadata,
            provisioner: sc.provisioner,
            parameters: sc.parameters.unwrap_or_default(),
            reclaim_policy: sc
                .reclaim_policy
                .as_deref()
                .map(ReclaimPolicy::from_str)
                .transpose()?
                .unwrap_or(ReclaimPolicy::Delete),
        })
    }

    fn to_kube(&self) -> KubeStorageClass {
        KubeStorageClass {
            metadata: meta_to_kube(&self.metadata, BTreeMap::new()),
            provisioner: self.provisioner.clone(),
            parameters: (!self.parameters.is_empty()).then(|| self.parameters.clone()),
            reclaim_policy: Some(self.reclaim_policy.to_string()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Kube Store
// =============================================================================

/// Translate API server rejections into store errors
fn map_api_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::conflict(kind, name),
        kube::Error::Api(resp) if resp.code == 410 => Error::Expired {
            kind: kind.to_string(),
            version: resp.message,
        },
        other => Error::Kube(other),
    }
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeStore<K: KubeMapped> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K: KubeMapped> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<K::Kube> {
        K::api(self.client.clone(), key.namespace.as_deref())
    }
}

#[async_trait]
impl<K: KubeMapped> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        let object = self
            .api_for(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_api_error(e, K::KIND, &key.to_string()))?;
        object.map(K::from_kube).transpose()
    }

    async fn list(&self) -> Result<ObjectList<K>> {
        let list = K::api(self.client.clone(), None)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_api_error(e, K::KIND, "*"))?;

        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        for object in list.items {
            match K::from_kube(object) {
                Ok(item) => items.push(item),
                // One malformed object must not block the whole kind
                Err(e) => debug!(kind = K::KIND, error = %e, "skipping unmappable object"),
            }
        }
        Ok(ObjectList {
            items,
            resource_version,
        })
    }

    async fn create(&self, object: K) -> Result<K> {
        let key = object.key();
        let created = self
            .api_for(&key)
            .create(&PostParams::default(), &object.to_kube())
            .await
            .map_err(|e| map_api_error(e, K::KIND, &key.to_string()))?;
        K::from_kube(created)
    }

    async fn update(&self, object: K) -> Result<K> {
        let key = object.key();
        let replaced = self
            .api_for(&key)
            .replace(&key.name, &PostParams::default(), &object.to_kube())
            .await
            .map_err(|e| map_api_error(e, K::KIND, &key.to_string()))?;
        K::from_kube(replaced)
    }

    async fn update_status(&self, object: K) -> Result<K> {
        let key = object.key();
        let body = serde_json::to_vec(&object.to_kube())?;
        let replaced = self
            .api_for(&key)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| map_api_error(e, K::KIND, &key.to_string()))?;
        K::from_kube(replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.api_for(key)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_api_error(e, K::KIND, &key.to_string()))?;
        Ok(())
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let api = K::api(self.client.clone(), None);
        let stream = api
            .watch(&WatchParams::default(), resource_version)
            .await
            .map_err(|e| map_api_error(e, K::KIND, "*"))?;

        let version = resource_version.to_string();
        let mapped = stream.filter_map(move |event| {
            futures::future::ready(map_watch_event::<K>(event, &version))
        });
        Ok(mapped.boxed())
    }

    fn backend_name(&self) -> &str {
        "kubernetes"
    }
}

/// Translate one API watch event; `None` skips it
///
/// An object that does not map is logged and skipped, as in `list`, so a
/// single malformed object never forces a relist of the whole kind.
fn map_watch_event<K: KubeMapped>(
    event: std::result::Result<KubeWatchEvent<K::Kube>, kube::Error>,
    version: &str,
) -> Option<Result<WatchEvent<K>>> {
    let (object, wrap): (K::Kube, fn(K) -> WatchEvent<K>) = match event {
        Ok(KubeWatchEvent::Added(o)) => (o, WatchEvent::Added),
        Ok(KubeWatchEvent::Modified(o)) => (o, WatchEvent::Modified),
        Ok(KubeWatchEvent::Deleted(o)) => (o, WatchEvent::Deleted),
        Ok(KubeWatchEvent::Bookmark(_)) => return None,
        Ok(KubeWatchEvent::Error(resp)) if resp.code == 410 => {
            return Some(Err(Error::Expired {
                kind: K::KIND.to_string(),
                version: version.to_string(),
            }))
        }
        Ok(KubeWatchEvent::Error(resp)) => return Some(Err(Error::StoreUnavailable(resp.message))),
        Err(e) => return Some(Err(map_api_error(e, K::KIND, "*"))),
    };
    match K::from_kube(object) {
        Ok(item) => Some(Ok(wrap(item))),
        Err(e) => {
            warn!(kind = K::KIND, error = %e, "skipping unmappable object in watch");
            None
        }
    }
}
