//! Object Store Adapters
//!
//! Implementations of [`ResourceStore`](crate::domain::ResourceStore): an
//! in-process versioned store and a Kubernetes API adapter.

pub mod kube;
pub mod memory;

use crate::domain::{Claim, ResourceStoreRef, StorageClass, Volume};
use memory::{MemoryStore, MemoryStoreConfig};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub use self::kube::{KubeMapped, KubeStore};
pub use memory::MemoryStore as InMemoryStore;

/// One store handle per watched kind
#[derive(Clone)]
pub struct Stores {
    pub volumes: ResourceStoreRef<Volume>,
    pub claims: ResourceStoreRef<Claim>,
    pub classes: ResourceStoreRef<StorageClass>,
}

/// Concrete in-memory stores, kept for direct inspection in tests
#[derive(Clone)]
pub struct MemoryStores {
    pub volumes: Arc<MemoryStore<Volume>>,
    pub claims: Arc<MemoryStore<Claim>>,
    pub classes: Arc<MemoryStore<StorageClass>>,
}

impl MemoryStores {
    /// Three kinds sharing one revision counter
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let revision = Arc::new(AtomicU64::new(0));
        Self {
            volumes: Arc::new(MemoryStore::with_revision(revision.clone(), config.clone())),
            claims: Arc::new(MemoryStore::with_revision(revision.clone(), config.clone())),
            classes: Arc::new(MemoryStore::with_revision(revision, config)),
        }
    }

    pub fn as_stores(&self) -> Stores {
        Stores {
            volumes: self.volumes.clone(),
            claims: self.claims.clone(),
            classes: self.classes.clone(),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    /// Stores backed by a Kubernetes API server
    pub fn kubernetes(client: ::kube::Client) -> Self {
        Self {
            volumes: Arc::new(KubeStore::<Volume>::new(client.clone())),
            claims: Arc::new(KubeStore::<Claim>::new(client.clone())),
            classes: Arc::new(KubeStore::<StorageClass>::new(client)),
        }
    }
}
