//! HTTP Volume Plugin
//!
//! Delegates asset management to a remote provisioner service:
//!
//! | Operation | Request                            |
//! |-----------|------------------------------------|
//! | provision | `POST   {endpoint}/volumes`        |
//! | is_ready  | `GET    {endpoint}/volumes/{id}`   |
//! | delete    | `DELETE {endpoint}/volumes/{id}`   |
//! | recycle   | `POST   {endpoint}/volumes/{id}/recycle` |
//!
//! Volumes it creates carry an `External` source whose driver is the plugin
//! name and whose handle is the remote id.

use crate::domain::{ProvisionOptions, ProvisionedVolume, Volume, VolumePlugin, VolumeSource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct HttpPluginSettings {
    pub name: String,
    /// Base URL of the provisioner service
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for HttpPluginSettings {
    fn default() -> Self {
        Self {
            name: "remote".to_string(),
            endpoint: "http://provisioner:9000".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Volume as reported by the remote service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVolume {
    pub id: String,
    pub capacity: u64,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// HTTP Plugin
// =============================================================================

/// Plugin backed by a remote provisioner service
pub struct HttpPlugin {
    settings: HttpPluginSettings,
    client: reqwest::Client,
}

impl HttpPlugin {
    pub fn new(settings: HttpPluginSettings) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self::with_client(settings, client))
    }

    pub fn with_client(settings: HttpPluginSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.endpoint.trim_end_matches('/'), path)
    }

    fn volume_url(&self, id: &str) -> String {
        self.url(&format!("/volumes/{}", urlencoding::encode(id)))
    }

    /// Remote id of a volume this plugin manages
    fn handle<'a>(&self, volume: &'a Volume) -> Result<&'a str> {
        match &volume.spec.source {
            Some(VolumeSource::External { driver, handle }) if *driver == self.settings.name => {
                Ok(handle)
            }
            _ => Err(Error::Unsupported {
                plugin: self.settings.name.clone(),
                operation: format!("manage volume {}", volume.metadata.name),
            }),
        }
    }

    async fn check(&self, operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_IMPLEMENTED || status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(Error::Unsupported {
                plugin: self.settings.name.clone(),
                operation: operation.to_string(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Internal(format!(
            "{} {} failed: HTTP {}: {}",
            self.settings.name, operation, status, body
        )))
    }
}

#[async_trait]
impl VolumePlugin for HttpPlugin {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn supports(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::External { driver, .. } if *driver == self.settings.name)
    }

    async fn provision(&self, options: &ProvisionOptions) -> Result<ProvisionedVolume> {
        info!(
            plugin = %self.settings.name,
            volume = %options.volume_name,
            claim = %options.claim,
            capacity = options.capacity,
            "requesting remote volume"
        );
        let response = self
            .client
            .post(self.url("/volumes"))
            .json(options)
            .send()
            .await?;
        let remote: RemoteVolume = self.check("provision", response).await?.json().await?;
        debug!(plugin = %self.settings.name, id = %remote.id, "remote volume created");

        Ok(ProvisionedVolume {
            source: VolumeSource::External {
                driver: self.settings.name.clone(),
                handle: remote.id,
            },
            capacity: remote.capacity,
            labels: remote.labels,
        })
    }

    async fn is_ready(&self, volume: &Volume) -> Result<bool> {
        let id = self.handle(volume)?;
        let response = self.client.get(self.volume_url(id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let remote: RemoteVolume = self.check("status", response).await?.json().await?;
        Ok(remote.ready)
    }

    async fn delete(&self, volume: &Volume) -> Result<()> {
        let id = self.handle(volume)?;
        let response = self.client.delete(self.volume_url(id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(plugin = %self.settings.name, id = %id, "remote volume already gone");
            return Ok(());
        }
        self.check("delete", response).await?;
        Ok(())
    }

    async fn recycle(&self, volume: &Volume) -> Result<()> {
        let id = self.handle(volume)?;
        let url = format!("{}/recycle", self.volume_url(id));
        let response = self.client.post(url).send().await?;
        self.check("recycle", response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccessMode, Claim, ReclaimPolicy, StorageClass};
    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Remote = Arc<Mutex<BTreeMap<String, RemoteVolume>>>;

    async fn create(State(remote): State<Remote>, Json(options): Json<ProvisionOptions>) -> Json<RemoteVolume> {
        let volume = RemoteVolume {
            id: format!("r-{}", options.volume_name),
            capacity: options.capacity * 2,
            ready: true,
            labels: BTreeMap::new(),
        };
        remote.lock().insert(volume.id.clone(), volume.clone());
        Json(volume)
    }

    async fn fetch(State(remote): State<Remote>, Path(id): Path<String>) -> std::result::Result<Json<RemoteVolume>, AxumStatus> {
        remote.lock().get(&id).cloned().map(Json).ok_or(AxumStatus::NOT_FOUND)
    }

    async fn remove(State(remote): State<Remote>, Path(id): Path<String>) -> AxumStatus {
        match remote.lock().remove(&id) {
            Some(_) => AxumStatus::NO_CONTENT,
            None => AxumStatus::NOT_FOUND,
        }
    }

    async fn recycle() -> AxumStatus {
        AxumStatus::NOT_IMPLEMENTED
    }

    async fn serve() -> (String, Remote) {
        let remote: Remote = Arc::default();
        let app = Router::new()
            .route("/volumes", post(create))
            .route("/volumes/:id", get(fetch).delete(remove))
            .route("/volumes/:id/recycle", post(recycle))
            .with_state(remote.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), remote)
    }

    #[tokio::test]
    async fn test_remote_lifecycle() {
        let (endpoint, remote) = serve().await;
        let plugin = HttpPlugin::new(HttpPluginSettings {
            name: "remote".into(),
            endpoint,
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        let mut claim = Claim::new("ns", "c", 10, [AccessMode::ReadWriteOnce]);
        claim.metadata.uid = "u1".into();
        let options = ProvisionOptions::for_claim("pvc-u1".into(), &claim, &StorageClass::new("fast", "remote"));
        let asset = plugin.provision(&options).await.unwrap();
        assert_eq!(asset.capacity, 20);
        assert!(plugin.supports(&asset.source));

        let volume = Volume::new("pvc-u1", asset.capacity, [AccessMode::ReadWriteOnce], ReclaimPolicy::Delete)
            .with_source(asset.source);
        assert!(plugin.is_ready(&volume).await.unwrap());

        assert!(matches!(plugin.recycle(&volume).await, Err(Error::Unsupported { .. })));

        plugin.delete(&volume).await.unwrap();
        assert!(remote.lock().is_empty());
        assert!(!plugin.is_ready(&volume).await.unwrap());
        plugin.delete(&volume).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_volume_rejected() {
        let plugin = HttpPlugin::new(HttpPluginSettings::default()).unwrap();
        let volume = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Delete)
            .with_source(VolumeSource::HostPath { path: "/data".into() });
        assert!(matches!(plugin.delete(&volume).await, Err(Error::Unsupported { .. })));
    }
}
