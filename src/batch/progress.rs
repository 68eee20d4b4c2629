//! Progress publication for batch runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::types::BatchStatus;

/// Callback invoked with every published status.
pub type ProgressCallback = Arc<dyn Fn(&BatchStatus) + Send + Sync>;

struct HubInner {
    subscribers: DashMap<u64, ProgressCallback>,
    next_id: AtomicU64,
    latest: watch::Sender<BatchStatus>,
}

/// Fans each published [`BatchStatus`] out to callbacks and watch streams.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for ProgressHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHub")
            .field("subscribers", &self.inner.subscribers.len())
            .field("latest", &self.latest())
            .finish()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(BatchStatus::default());
        Self {
            inner: Arc::new(HubInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(0),
                latest,
            }),
        }
    }

    /// Registers `callback` until the returned subscription is dropped or unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BatchStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, Arc::new(callback));
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Stream of statuses, starting with the latest one. Intermediate values may be skipped
    /// by a slow reader.
    pub fn watch(&self) -> WatchStream<BatchStatus> {
        WatchStream::new(self.inner.latest.subscribe())
    }

    pub fn latest(&self) -> BatchStatus {
        *self.inner.latest.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub(crate) fn publish(&self, status: BatchStatus) {
        self.inner.latest.send_replace(status);

        // Callbacks run outside the map lock so they may subscribe or unsubscribe.
        let callbacks: Vec<ProgressCallback> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for callback in callbacks {
            callback(&status);
        }
    }
}

/// Handle to a progress callback registration.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.remove(&self.id);
        }
    }
}
