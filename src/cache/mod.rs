//! Event Source
//!
//! Local view of the object store and the machinery that feeds the
//! reconciliation loops:
//! - **Object cache**: per-kind indexed copy (DashMap)
//! - **Informer**: list + watch + relist + periodic resync
//! - **Work queue**: deduplicating, per-key exclusive, rate limited
//! - **Key locks**: serialize work on one object across loops
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   watch    ┌────────────┐  ControllerEvent  ┌──────────────┐
//! │ Object Store │ ─────────▶ │  Informer  │ ────────────────▶ │  Dispatcher  │
//! └──────────────┘            └─────┬──────┘                   └──────┬───────┘
//!                                   │ store_if_newer                  │ add(key)
//!                             ┌─────┴──────┐                   ┌──────┴───────┐
//!                             │ObjectCache │ ◀── reads ─────── │  WorkQueue   │
//!                             └────────────┘                   └──────────────┘
//! ```

pub mod events;
pub mod informer;
pub mod locks;
pub mod metrics;
pub mod queue;
pub mod store;

pub use events::{BinderEvent, ControllerEvent, ResourceEvent, Watched};
pub use informer::Informer;
pub use locks::KeyLocks;
pub use metrics::BinderMetrics;
pub use queue::{WorkQueue, WorkQueueConfig};
pub use store::{CacheUpdate, ObjectCache};

use crate::domain::{Claim, StorageClass, Volume};
use std::sync::Arc;

/// Caches for every watched kind
#[derive(Clone, Default)]
pub struct Caches {
    pub volumes: Arc<ObjectCache<Volume>>,
    pub claims: Arc<ObjectCache<Claim>>,
    pub classes: Arc<ObjectCache<StorageClass>>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }
}
