//! REST API Handlers
//!
//! Read-only views served from the controller's caches. Nothing here
//! writes to the object store; binding decisions stay with the binder.

use crate::controlplane::controller::ControllerHandle;
use crate::domain::{AccessMode, Claim, ClaimPhase, ObjectKey, ReclaimPolicy, Volume, VolumePhase};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeView {
    pub name: String,
    pub phase: VolumePhase,
    pub capacity: u64,
    pub access_modes: BTreeSet<AccessMode>,
    pub storage_class: String,
    pub reclaim_policy: ReclaimPolicy,
    /// `namespace/name` of the claim this volume points at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim: Option<String>,
    pub bound_by_controller: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<Volume> for VolumeView {
    fn from(volume: Volume) -> Self {
        Self {
            claim: volume.spec.claim_ref.as_ref().map(|r| r.key().to_string()),
            name: volume.metadata.name,
            phase: volume.status.phase,
            capacity: volume.spec.capacity,
            access_modes: volume.spec.access_modes,
            storage_class: volume.spec.storage_class_name,
            reclaim_policy: volume.spec.reclaim_policy,
            bound_by_controller: volume.markers.bound_by_controller,
            provisioned_by: volume.markers.provisioned_by,
            message: volume.status.message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimView {
    pub namespace: String,
    pub name: String,
    pub phase: ClaimPhase,
    pub requested: u64,
    pub access_modes: BTreeSet<AccessMode>,
    /// Requested class; absent when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub volume_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    pub bind_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_failure: Option<String>,
}

impl From<Claim> for ClaimView {
    fn from(claim: Claim) -> Self {
        let provisioning = claim.markers.provisioning.as_ref();
        Self {
            namespace: claim.namespace().to_string(),
            storage_class: claim.spec.storage_class.as_option().map(str::to_string),
            provisioning_attempts: provisioning.map(|p| p.attempts),
            provisioning_failure: provisioning.and_then(|p| p.last_failure.clone()),
            name: claim.metadata.name,
            phase: claim.status.phase,
            requested: claim.spec.requested,
            access_modes: claim.spec.access_modes,
            volume_name: claim.spec.volume_name,
            capacity: claim.status.capacity,
            bind_completed: claim.markers.bind_completed,
        }
    }
}

/// Object counts by phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub ready: bool,
    pub volumes: BTreeMap<String, usize>,
    pub claims: BTreeMap<String, usize>,
    pub storage_classes: usize,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClaimFilter {
    pub namespace: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// Router builder
pub struct RestRouter {
    handle: ControllerHandle,
}

impl RestRouter {
    pub fn new(handle: ControllerHandle) -> Self {
        Self { handle }
    }

    pub fn build(self) -> Router {
        Router::new()
            .route("/healthz", get(health_check))
            .route("/readyz", get(readiness_check))
            .route("/metrics", get(metrics))
            .route("/v1/volumes", get(list_volumes))
            .route("/v1/volumes/:name", get(get_volume))
            .route("/v1/claims", get(list_claims))
            .route("/v1/claims/:namespace/:name", get(get_claim))
            .route("/v1/status", get(status))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.handle)
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiErrorResponse {
            error: "not_found".into(),
            message,
        }),
    )
        .into_response()
}

async fn health_check() -> &'static str {
    "ok"
}

async fn readiness_check(State(handle): State<ControllerHandle>) -> Response {
    if handle.is_ready() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced").into_response()
    }
}

async fn metrics(State(handle): State<ControllerHandle>) -> Response {
    match handle.metrics().encode() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorResponse {
                    error: "internal_error".into(),
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn list_volumes(State(handle): State<ControllerHandle>) -> Json<Vec<VolumeView>> {
    let mut volumes: Vec<VolumeView> = handle
        .caches()
        .volumes
        .list()
        .into_iter()
        .map(VolumeView::from)
        .collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    Json(volumes)
}

async fn get_volume(State(handle): State<ControllerHandle>, Path(name): Path<String>) -> Response {
    match handle.caches().volumes.get_by_name(&name) {
        Some(volume) => Json(VolumeView::from(volume)).into_response(),
        None => not_found(format!("volume {} not found", name)),
    }
}

async fn list_claims(
    State(handle): State<ControllerHandle>,
    Query(filter): Query<ClaimFilter>,
) -> Json<Vec<ClaimView>> {
    let mut claims: Vec<ClaimView> = handle
        .caches()
        .claims
        .list_filtered(|c| filter.namespace.as_deref().map_or(true, |ns| c.namespace() == ns))
        .into_iter()
        .map(ClaimView::from)
        .collect();
    claims.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    Json(claims)
}

async fn get_claim(
    State(handle): State<ControllerHandle>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = ObjectKey::namespaced(namespace, name);
    match handle.caches().claims.get(&key) {
        Some(claim) => Json(ClaimView::from(claim)).into_response(),
        None => not_found(format!("claim {} not found", key)),
    }
}

async fn status(State(handle): State<ControllerHandle>) -> Json<StatusResponse> {
    let caches = handle.caches();
    let mut volumes = BTreeMap::new();
    for volume in caches.volumes.list() {
        *volumes.entry(volume.phase().to_string()).or_insert(0) += 1;
    }
    let mut claims = BTreeMap::new();
    for claim in caches.claims.list() {
        *claims.entry(claim.phase().to_string()).or_insert(0) += 1;
    }

    Json(StatusResponse {
        ready: handle.is_ready(),
        volumes,
        claims,
        storage_classes: caches.classes.len(),
        plugins: handle.binder().plugins().names(),
    })
}
