//! Informer
//!
//! Keeps an [`ObjectCache`] current for one kind: list, then watch from the
//! list's version, relist when the watch expires or fails, and re-deliver
//! every cached object on a fixed resync period so missed events heal.

use super::events::{ControllerEvent, ResourceEvent, Watched};
use super::metrics::BinderMetrics;
use super::store::{CacheUpdate, ObjectCache};
use crate::domain::{ObjectKey, ResourceStoreRef, WatchEvent};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event source for one object kind
pub struct Informer<K: Watched> {
    store: ResourceStoreRef<K>,
    cache: Arc<ObjectCache<K>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    resync_period: Duration,
    synced: Arc<AtomicBool>,
    metrics: Option<BinderMetrics>,
}

impl<K: Watched> Informer<K> {
    pub fn new(
        store: ResourceStoreRef<K>,
        cache: Arc<ObjectCache<K>>,
        events: mpsc::UnboundedSender<ControllerEvent>,
        resync_period: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            resync_period,
            synced: Arc::new(AtomicBool::new(false)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BinderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Flag flipped once the first list has been delivered
    pub fn synced_flag(&self) -> Arc<AtomicBool> {
        self.synced.clone()
    }

    fn emit(&self, event: ResourceEvent<K>) {
        // Receiver gone means the controller is shutting down
        let _ = self.events.send(K::wrap(event));
    }

    /// Run until cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            match self.list_and_watch(&shutdown, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    if let Some(m) = &self.metrics {
                        m.relists.inc();
                    }
                    let delay = match e {
                        Error::Expired { .. } => Duration::ZERO,
                        _ => backoff.next_backoff().unwrap_or(Duration::from_secs(30)),
                    };
                    warn!(kind = K::KIND, error = %e, delay_ms = delay.as_millis() as u64, "watch failed; relisting");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(kind = K::KIND, "informer stopped");
    }

    /// Returns `Ok` only on cancellation
    async fn list_and_watch(
        &self,
        shutdown: &CancellationToken,
        backoff: &mut ExponentialBackoff,
    ) -> Result<()> {
        let list = self.store.list().await?;
        backoff.reset();
        let count = list.items.len();
        self.apply_list(list.items);
        if !self.synced.swap(true, Ordering::SeqCst) {
            info!(kind = K::KIND, count, backend = self.store.backend_name(), "initial list synced");
        }

        let mut version = list.resource_version;
        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync_period,
            self.resync_period,
        );
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let mut stream = self.store.watch(&version).await?;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = resync.tick() => self.resync(),
                    next = stream.next() => match next {
                        // Server closed the watch; resume from the last version seen
                        None => break,
                        Some(Ok(event)) => {
                            version = event.object().resource_version().to_string();
                            self.apply(event);
                        }
                        Some(Err(e)) => return Err(e),
                    }
                }
            }
        }
    }

    fn apply_list(&self, items: Vec<K>) {
        let keep: HashSet<ObjectKey> = items.iter().map(|o| o.key()).collect();
        for gone in self.cache.retain_only(&keep) {
            self.emit(ResourceEvent::Deleted(gone));
        }
        for item in items {
            match self.cache.store_if_newer(item.clone()) {
                CacheUpdate::Inserted => self.emit(ResourceEvent::Added(item)),
                CacheUpdate::Replaced(old) => self.emit(ResourceEvent::Updated { old, new: item }),
                CacheUpdate::Stale => {}
            }
        }
    }

    fn apply(&self, event: WatchEvent<K>) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                match self.cache.store_if_newer(obj.clone()) {
                    CacheUpdate::Inserted => self.emit(ResourceEvent::Added(obj)),
                    CacheUpdate::Replaced(old) => self.emit(ResourceEvent::Updated { old, new: obj }),
                    CacheUpdate::Stale => {}
                }
            }
            WatchEvent::Deleted(obj) => {
                let last = self.cache.remove(&obj.key()).unwrap_or(obj);
                self.emit(ResourceEvent::Deleted(last));
            }
        }
    }

    fn resync(&self) {
        let objects = self.cache.list();
        debug!(kind = K::KIND, count = objects.len(), "periodic resync");
        for obj in objects {
            self.emit(ResourceEvent::Resynced(obj));
        }
    }
}
