//! Volume Binder
//!
//! A reconciliation controller that binds storage volumes to claims in a
//! watchable, versioned object store, provisions new volumes on demand and
//! reclaims released ones according to their policy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           Object Store (kube / memory)                      │
//! └───────────────┬──────────────────────────────────────────────▲──────────────┘
//!                 │ list + watch                                 │ CAS writes
//! ┌───────────────▼───────────────┐                              │
//! │  Informers → Caches → Queues  │                              │
//! └───────────────┬───────────────┘                              │
//!                 │ keys                                         │
//! ┌───────────────▼──────────────────────────────────────────────┴──────────────┐
//! │                                   Binder                                    │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐  ┌──────────────┐  │
//! │  │  Claim sync   │  │  Volume sync  │  │  Provisioner  │  │   Reclaimer  │  │
//! │  └───────────────┘  └───────────────┘  └───────┬───────┘  └──────┬───────┘  │
//! └────────────────────────────────────────────────┼─────────────────┼──────────┘
//!                                                  │   VolumePlugin  │
//!                                         ┌────────▼─────────────────▼────────┐
//!                                         │   host-path  │  http provisioner  │
//!                                         └───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: object model, ports and label selectors
//! - [`store`]: object store adapters
//! - [`cache`]: informers, caches, work queues, metrics
//! - [`binder`]: matching, binding, provisioning and reclaim
//! - [`controlplane`]: controller runtime, plugins and operator API
//! - [`config`]: YAML configuration
//! - [`error`]: error types and handling

pub mod binder;
pub mod cache;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod store;

// Re-export commonly used types
pub use binder::{find_match, Binder, PluginRegistry};

pub use cache::{BinderEvent, BinderMetrics, Caches};

pub use config::{BinderConfig, ControllerConfig, PluginsConfig, ServerConfig};

pub use controlplane::{
    ApiServer, ApiServerConfig, BackendFactory, Controller, ControllerHandle,
};

pub use domain::{
    AccessMode, Claim, ClaimPhase, ClaimRef, LabelSelector, ReclaimPolicy, ResourceStore,
    StorageClass, StorageClassRequest, Volume, VolumePhase, VolumePlugin, VolumeSource,
};

pub use error::{Error, ErrorAction, Result};

pub use store::{MemoryStores, Stores};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
