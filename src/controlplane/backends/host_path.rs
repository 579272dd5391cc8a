//! Host-Path Volume Plugin
//!
//! Provides volumes as directories under a local root. Intended for
//! single-node clusters and tests; capacity is advisory.

use crate::domain::{
    ProvisionOptions, ProvisionedVolume, Volume, VolumePlugin, VolumeSource,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the host-path plugin
#[derive(Debug, Clone)]
pub struct HostPathConfig {
    /// Plugin name StorageClasses refer to
    pub name: String,
    /// Directory new volumes are created under
    pub root: PathBuf,
}

impl Default for HostPathConfig {
    fn default() -> Self {
        Self {
            name: "host-path".to_string(),
            root: PathBuf::from("/var/lib/volume-binder"),
        }
    }
}

// =============================================================================
// Host-Path Plugin
// =============================================================================

/// Plugin managing directories under a root
pub struct HostPathPlugin {
    config: HostPathConfig,
}

impl HostPathPlugin {
    pub fn new(config: HostPathConfig) -> Self {
        Self { config }
    }

    fn volume_dir(&self, volume_name: &str) -> Result<PathBuf> {
        if volume_name.is_empty() || volume_name.contains('/') || volume_name.starts_with('.') {
            return Err(Error::InvalidObject {
                kind: "Volume".into(),
                name: volume_name.into(),
                reason: "name is not a valid directory name".into(),
            });
        }
        Ok(self.config.root.join(volume_name))
    }

    /// `path` if it names exactly one valid volume directory directly under
    /// the root
    ///
    /// `Path::parent` is lexical, so `<root>/..` and `<root>/.` must be
    /// rejected by component rather than by parent.
    fn contained(&self, path: &Path) -> Option<PathBuf> {
        let rest = path.strip_prefix(&self.config.root).ok()?;
        let mut components = rest.components();
        let name = match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => name.to_str()?,
            _ => return None,
        };
        self.volume_dir(name).ok()
    }

    /// Directory behind `volume`, only if it lives under our root
    fn owned_path(&self, volume: &Volume) -> Result<PathBuf> {
        match &volume.spec.source {
            Some(VolumeSource::HostPath { path }) => {
                self.contained(Path::new(path)).ok_or_else(|| Error::Unsupported {
                    plugin: self.config.name.clone(),
                    operation: format!("manage {} outside {}", path, self.config.root.display()),
                })
            }
            _ => Err(Error::Unsupported {
                plugin: self.config.name.clone(),
                operation: format!("manage volume {} without a host path", volume.metadata.name),
            }),
        }
    }

    async fn empty_dir(path: &Path) -> Result<()> {
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let child = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&child).await?;
            } else {
                tokio::fs::remove_file(&child).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VolumePlugin for HostPathPlugin {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::HostPath { path }
            if self.contained(Path::new(path)).is_some())
    }

    async fn provision(&self, options: &ProvisionOptions) -> Result<ProvisionedVolume> {
        let dir = self.volume_dir(&options.volume_name)?;
        info!(
            volume = %options.volume_name,
            claim = %options.claim,
            path = %dir.display(),
            "creating host-path volume"
        );
        tokio::fs::create_dir_all(&dir).await?;

        let mut labels = BTreeMap::new();
        labels.insert("volume-binder.io/plugin".to_string(), self.config.name.clone());
        Ok(ProvisionedVolume {
            source: VolumeSource::HostPath {
                path: dir.to_string_lossy().into_owned(),
            },
            capacity: options.capacity,
            labels,
        })
    }

    async fn is_ready(&self, volume: &Volume) -> Result<bool> {
        let path = self.owned_path(volume)?;
        Ok(tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn delete(&self, volume: &Volume) -> Result<()> {
        let path = self.owned_path(volume)?;
        debug!(volume = %volume.metadata.name, path = %path.display(), "removing host-path volume");
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn recycle(&self, volume: &Volume) -> Result<()> {
        let path = self.owned_path(volume)?;
        debug!(volume = %volume.metadata.name, path = %path.display(), "scrubbing host-path volume");
        Self::empty_dir(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccessMode, Claim, ReclaimPolicy, StorageClass};

    fn plugin(root: &Path) -> HostPathPlugin {
        HostPathPlugin::new(HostPathConfig {
            name: "host-path".into(),
            root: root.to_path_buf(),
        })
    }

    fn options(volume_name: &str) -> ProvisionOptions {
        let mut claim = Claim::new("ns", "c", 1024, [AccessMode::ReadWriteOnce]);
        claim.metadata.uid = "uid-1".into();
        ProvisionOptions::for_claim(volume_name.into(), &claim, &StorageClass::new("local", "host-path"))
    }

    fn volume_for(asset: ProvisionedVolume) -> Volume {
        Volume::new("pvc-uid-1", asset.capacity, [AccessMode::ReadWriteOnce], ReclaimPolicy::Delete)
            .with_source(asset.source)
    }

    #[tokio::test]
    async fn test_provision_recycle_delete() {
        let root = tempfile::tempdir().unwrap();
        let plugin = plugin(root.path());

        let asset = plugin.provision(&options("pvc-uid-1")).await.unwrap();
        assert!(plugin.supports(&asset.source));
        let volume = volume_for(asset);
        assert!(plugin.is_ready(&volume).await.unwrap());

        let dir = root.path().join("pvc-uid-1");
        std::fs::write(dir.join("data.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.join("nested")).unwrap();

        plugin.recycle(&volume).await.unwrap();
        assert!(dir.exists());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        plugin.delete(&volume).await.unwrap();
        assert!(!dir.exists());
        assert!(!plugin.is_ready(&volume).await.unwrap());
        // Deleting twice is fine
        plugin.delete(&volume).await.unwrap();
    }

    #[tokio::test]
    async fn test_refuses_paths_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let plugin = plugin(root.path());

        let foreign = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Delete)
            .with_source(VolumeSource::HostPath { path: "/etc".into() });
        assert!(!plugin.supports(foreign.spec.source.as_ref().unwrap()));
        assert!(matches!(plugin.delete(&foreign).await, Err(Error::Unsupported { .. })));

        assert!(plugin.provision(&options("../escape")).await.is_err());
    }

    #[tokio::test]
    async fn test_refuses_dot_components_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(root.join(".hidden")).unwrap();
        let precious = tmp.path().join("precious.txt");
        std::fs::write(&precious, b"keep me").unwrap();
        let plugin = plugin(&root);

        for suffix in ["..", ".", ".hidden", "a/b"] {
            let path = format!("{}/{}", root.display(), suffix);
            let volume = Volume::new("pv", 1, [AccessMode::ReadWriteOnce], ReclaimPolicy::Delete)
                .with_source(VolumeSource::HostPath { path: path.clone() });
            assert!(!plugin.supports(volume.spec.source.as_ref().unwrap()), "{}", path);
            assert!(matches!(plugin.delete(&volume).await, Err(Error::Unsupported { .. })), "{}", path);
            assert!(matches!(plugin.recycle(&volume).await, Err(Error::Unsupported { .. })), "{}", path);
        }
        assert!(precious.exists());
        assert!(root.join(".hidden").is_dir());

        // A trailing separator still names the same directory
        let source = VolumeSource::HostPath {
            path: format!("{}/pvc-1/", root.display()),
        };
        assert!(plugin.supports(&source));
    }
}
