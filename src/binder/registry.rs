//! Plugin Registry
//!
//! Volume plugins indexed by name. A StorageClass selects its provisioner by
//! name; deleters and recyclers are found through the volume's
//! `provisioned_by` marker first, then by which plugin understands the
//! volume's source.

use crate::domain::{Volume, VolumePluginRef};
use crate::error::{Error, Result};
use indexmap::IndexMap;

/// Registered volume plugins, in registration order
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: IndexMap<String, VolumePluginRef>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: VolumePluginRef) -> Result<()> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "volume plugin {} registered twice",
                name
            )));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Plugin named by a StorageClass provisioner
    pub fn get(&self, name: &str) -> Option<VolumePluginRef> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugin responsible for the asset behind `volume`
    fn find_for(&self, volume: &Volume) -> Option<VolumePluginRef> {
        if let Some(plugin) = volume
            .markers
            .provisioned_by
            .as_deref()
            .and_then(|name| self.get(name))
        {
            return Some(plugin);
        }
        let source = volume.spec.source.as_ref()?;
        self.plugins.values().find(|p| p.supports(source)).cloned()
    }

    pub fn find_deleter(&self, volume: &Volume) -> Option<VolumePluginRef> {
        self.find_for(volume)
    }

    pub fn find_recycler(&self, volume: &Volume) -> Option<VolumePluginRef> {
        self.find_for(volume)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
