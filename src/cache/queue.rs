//! Work Queue
//!
//! Deduplicating FIFO of object keys with per-key exclusivity and
//! rate-limited requeue. A key added while it is being processed is
//! parked and handed out again once the current pass calls `done`, so
//! one key is never reconciled by two workers at once.

use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// =============================================================================
// Queue Configuration
// =============================================================================

/// Backoff settings for rate-limited requeues
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Delay of the first retry
    pub base_delay: Duration,
    /// Ceiling for exponential growth
    pub max_delay: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Work Queue
// =============================================================================

#[derive(Default)]
struct State {
    /// Keys ready to hand out, in arrival order
    queue: IndexSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    /// Keys needing another pass
    dirty: HashSet<String>,
    /// Consecutive failures per key
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    config: WorkQueueConfig,
}

/// Cloneable handle to a shared work queue
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: &'static str, config: WorkQueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Enqueue a key; duplicates collapse into one pending entry
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.insert(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue after a delay
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue with per-key exponential backoff
    pub fn add_rate_limited(&self, key: impl Into<String>) -> Duration {
        let key = key.into();
        let failures = {
            let mut state = self.inner.state.lock();
            let n = state.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = self.backoff_for(failures);
        self.add_after(key, delay);
        delay
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let config = &self.inner.config;
        let exp = failures.saturating_sub(1).min(31);
        config
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(config.max_delay)
            .min(config.max_delay)
    }

    /// Clear failure history for a key
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for a key
    pub fn failures(&self, key: &str) -> u32 {
        self.inner.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.shift_remove_index(0) {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Finish a pass over `key`, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.insert(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue {
        WorkQueue::new(
            "test",
            WorkQueueConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn test_duplicates_collapse() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_parked() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        assert_eq!(q.len(), 0, "must not hand out a key already in flight");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_backoff_is_capped() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(20));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(40));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(50));
        assert_eq!(q.failures("a"), 4);

        q.forget("a");
        assert_eq!(q.failures("a"), 0);

        let key = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[test]
    fn test_get_parks_until_work_arrives() {
        use tokio_test::{assert_pending, assert_ready, task};

        let q = queue();
        let mut get = task::spawn(q.get());
        assert_pending!(get.poll());

        q.add("a");
        assert!(get.is_woken());
        assert_eq!(assert_ready!(get.poll()).as_deref(), Some("a"));
    }
}
