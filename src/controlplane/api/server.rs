//! API Server
//!
//! Serves the operator router until the shutdown token is cancelled.

use crate::config::ServerConfig;
use crate::controlplane::controller::ControllerHandle;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Bind address
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl TryFrom<&ServerConfig> for ApiServerConfig {
    type Error = Error;

    fn try_from(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            addr: config.socket_addr()?,
        })
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    handle: ControllerHandle,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, handle: ControllerHandle) -> Self {
        Self { config, handle }
    }

    /// Bind and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {}: {}", self.config.addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        let app = RestRouter::new(self.handle).build();
        info!(%addr, "operator API listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("operator API shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("operator API error: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::PluginRegistry;
    use crate::config::ControllerConfig;
    use crate::controlplane::controller::Controller;
    use crate::store::MemoryStores;

    #[test]
    fn test_config_from_server_section() {
        let config = ApiServerConfig::try_from(&ServerConfig {
            addr: "127.0.0.1:9100".into(),
        })
        .unwrap();
        assert_eq!(config.addr.port(), 9100);
        assert_eq!(ApiServerConfig::default().addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_serves_until_cancelled() {
        let controller = Controller::new(
            MemoryStores::new().as_stores(),
            PluginRegistry::new(),
            ControllerConfig::default(),
        )
        .unwrap();
        let server = ApiServer::new(ApiServerConfig::default(), controller.handle());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(listener, shutdown.clone()));

        let body = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
