//! Volume Plugin Backends
//!
//! Provides plugins for the assets behind volumes:
//! - host-path: directories under a local root
//! - http: a remote provisioner service

pub mod host_path;
pub mod http;

pub use host_path::{HostPathConfig, HostPathPlugin};
pub use http::{HttpPlugin, HttpPluginSettings, RemoteVolume};

use crate::binder::PluginRegistry;
use crate::config::PluginsConfig;
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Factory for building the plugin registry from configuration
pub struct BackendFactory;

impl BackendFactory {
    /// Register every configured plugin
    pub fn create(config: &PluginsConfig) -> Result<PluginRegistry> {
        let mut registry = PluginRegistry::new();

        for host_path in &config.host_path {
            info!(plugin = %host_path.name, root = %host_path.root, "registering host-path plugin");
            registry.register(Arc::new(HostPathPlugin::new(HostPathConfig {
                name: host_path.name.clone(),
                root: PathBuf::from(&host_path.root),
            })))?;
        }

        for remote in &config.http {
            info!(plugin = %remote.name, endpoint = %remote.endpoint, "registering http plugin");
            registry.register(Arc::new(HttpPlugin::new(HttpPluginSettings {
                name: remote.name.clone(),
                endpoint: remote.endpoint.clone(),
                timeout: Duration::from_secs(remote.timeout_secs),
            })?))?;
        }

        Ok(registry)
    }
}
