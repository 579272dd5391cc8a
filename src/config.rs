//! Controller Configuration
//!
//! YAML configuration file with defaults for every key; the binary layers
//! CLI/env overrides on top.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Complete configuration for the volume binder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BinderConfig {
    pub controller: ControllerConfig,
    pub plugins: PluginsConfig,
    pub server: ServerConfig,
}

impl BinderConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.plugins.validate()?;
        self.server.socket_addr()?;
        Ok(())
    }
}

// =============================================================================
// Controller Configuration
// =============================================================================

/// Reconciliation loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Periodic resync of every cached object
    pub sync_period_secs: u64,
    /// Workers per object kind
    pub workers: usize,
    /// Optimistic-write attempts per bind pass
    pub bind_retry_budget: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub provision_max_attempts: u32,
    pub provision_retry_base_secs: u64,
    pub provision_retry_max_secs: u64,
    pub reclaim_retry_base_secs: u64,
    pub reclaim_retry_max_secs: u64,
    /// Class an unset claim class resolves to
    pub default_storage_class: Option<String>,
    pub enable_dynamic_provisioning: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_period_secs: 15,
            workers: 1,
            bind_retry_budget: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            provision_max_attempts: 8,
            provision_retry_base_secs: 1,
            provision_retry_max_secs: 300,
            reclaim_retry_base_secs: 1,
            reclaim_retry_max_secs: 300,
            default_storage_class: None,
            enable_dynamic_provisioning: true,
        }
    }
}

/// `base * 2^(n-1)`, capped
fn exponential(base: Duration, max: Duration, n: u32) -> Duration {
    let exp = n.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(max).min(max)
}

impl ControllerConfig {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Upper bound on how long a consistent state takes to settle
    ///
    /// One resync to notice, one more in case the first pass lost a race,
    /// plus the longest transient-error backoff.
    pub fn convergence_bound(&self) -> Duration {
        self.sync_period() * 2 + self.retry_max_delay()
    }

    /// Wait before provisioning attempt number `attempts + 1`
    pub fn provision_backoff(&self, attempts: u32) -> Duration {
        exponential(
            Duration::from_secs(self.provision_retry_base_secs),
            Duration::from_secs(self.provision_retry_max_secs),
            attempts,
        )
    }

    /// Wait after `failures` consecutive reclaim failures
    pub fn reclaim_backoff(&self, failures: u32) -> Duration {
        exponential(
            Duration::from_secs(self.reclaim_retry_base_secs),
            Duration::from_secs(self.reclaim_retry_max_secs),
            failures,
        )
    }

    pub fn default_class(&self) -> Option<&str> {
        self.default_storage_class.as_deref().filter(|c| !c.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_period_secs == 0 {
            return Err(Error::Configuration("syncPeriodSecs must be positive".into()));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be positive".into()));
        }
        if self.bind_retry_budget == 0 {
            return Err(Error::Configuration("bindRetryBudget must be positive".into()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(Error::Configuration(
                "retryBaseDelayMs exceeds retryMaxDelayMs".into(),
            ));
        }
        if self.provision_retry_base_secs > self.provision_retry_max_secs {
            return Err(Error::Configuration(
                "provisionRetryBaseSecs exceeds provisionRetryMaxSecs".into(),
            ));
        }
        if self.reclaim_retry_base_secs > self.reclaim_retry_max_secs {
            return Err(Error::Configuration(
                "reclaimRetryBaseSecs exceeds reclaimRetryMaxSecs".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Plugin Configuration
// =============================================================================

/// Volume plugins to register
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginsConfig {
    pub host_path: Vec<HostPathPluginConfig>,
    pub http: Vec<HttpPluginConfig>,
}

impl PluginsConfig {
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let names = self
            .host_path
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.http.iter().map(|p| p.name.as_str()));
        for name in names {
            if name.is_empty() {
                return Err(Error::Configuration("plugin name must not be empty".into()));
            }
            if !seen.insert(name) {
                return Err(Error::Configuration(format!("duplicate plugin name {:?}", name)));
            }
        }
        for http in &self.http {
            reqwest::Url::parse(&http.endpoint).map_err(|e| {
                Error::Configuration(format!("invalid endpoint for plugin {}: {}", http.name, e))
            })?;
        }
        Ok(())
    }
}

/// Directories under a local root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPathPluginConfig {
    pub name: String,
    pub root: String,
}

/// Remote provisioner service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpPluginConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Operator HTTP surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid server address {:?}: {}", self.addr, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BinderConfig::default();
        assert_eq!(config.controller.sync_period(), Duration::from_secs(15));
        assert_eq!(config.controller.workers, 1);
        assert!(config.controller.enable_dynamic_provisioning);
        assert_eq!(config.server.socket_addr().unwrap().port(), 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = BinderConfig::from_yaml(
            r#"
controller:
  syncPeriodSecs: 1
  defaultStorageClass: standard
plugins:
  hostPath:
    - name: host-path
      root: /srv/volumes
  http:
    - name: remote
      endpoint: http://provisioner:9000
"#,
        )
        .unwrap();
        assert_eq!(config.controller.sync_period_secs, 1);
        assert_eq!(config.controller.bind_retry_budget, 5);
        assert_eq!(config.controller.default_class(), Some("standard"));
        assert_eq!(config.plugins.host_path[0].root, "/srv/volumes");
        assert_eq!(config.plugins.http[0].timeout_secs, 30);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(BinderConfig::from_yaml("controller:\n  workers: 0\n").is_err());
        assert!(BinderConfig::from_yaml(
            "plugins:\n  hostPath:\n    - {name: a, root: /x}\n    - {name: a, root: /y}\n"
        )
        .is_err());
        assert!(BinderConfig::from_yaml("server:\n  addr: nowhere\n").is_err());
    }

    #[test]
    fn test_backoff_and_convergence_bound() {
        let config = ControllerConfig {
            sync_period_secs: 1,
            retry_max_delay_ms: 2_000,
            provision_retry_base_secs: 1,
            provision_retry_max_secs: 5,
            ..Default::default()
        };
        assert_eq!(config.convergence_bound(), Duration::from_secs(4));
        assert_eq!(config.provision_backoff(1), Duration::from_secs(1));
        assert_eq!(config.provision_backoff(3), Duration::from_secs(4));
        assert_eq!(config.provision_backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  addr: 127.0.0.1:9999").unwrap();
        let config = BinderConfig::load(file.path()).unwrap();
        assert_eq!(config.server.socket_addr().unwrap().port(), 9999);
    }
}
