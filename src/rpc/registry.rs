//! Correlation registry: pending request bookkeeping for one channel.
//!
//! Every entry is settled at most once. Whichever of resolve, reject, timeout or
//! `clear_all` removes the entry from the map first wins; later attempts see an unknown id
//! and report `false`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::RpcError;
use crate::protocol::{CorrelationId, ResponseData};

/// Default window a request may stay pending before it is rejected.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Final value delivered to the caller awaiting a correlation.
pub type Settlement = Result<ResponseData, RpcError>;

struct PendingEntry {
    sender: oneshot::Sender<Settlement>,
    timer: JoinHandle<()>,
    registered_at: Instant,
}

/// Maps correlation ids to the callers awaiting them.
#[derive(Clone)]
pub struct CorrelationRegistry {
    pending: Arc<DashMap<CorrelationId, PendingEntry>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl CorrelationRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of correlations still awaiting settlement.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Registers `id` with the registry's default timeout.
    pub fn register(&self, id: CorrelationId) -> Result<PendingResponse, RpcError> {
        self.register_with_timeout(id, self.default_timeout)
    }

    /// Registers `id` and arms its timeout timer. Must be called within a Tokio runtime.
    pub fn register_with_timeout(
        &self,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<PendingResponse, RpcError> {
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateCorrelation(id)),
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                let timer = spawn_timeout(Arc::downgrade(&self.pending), id.clone(), timeout);
                slot.insert(PendingEntry {
                    sender,
                    timer,
                    registered_at: Instant::now(),
                });
                debug!(correlation_id = %id, timeout_ms = timeout.as_millis() as u64, "Registered correlation");
                Ok(PendingResponse { id, receiver })
            }
        }
    }

    /// Settles `id` successfully. Returns `false` if the id is unknown or already settled.
    pub fn resolve(&self, id: &CorrelationId, value: ResponseData) -> bool {
        self.settle(id, Ok(value))
    }

    /// Settles `id` with an error. Returns `false` if the id is unknown or already settled.
    pub fn reject(&self, id: &CorrelationId, error: RpcError) -> bool {
        self.settle(id, Err(error))
    }

    /// Rejects every pending correlation with `error`, returning how many were rejected.
    pub fn clear_all(&self, error: RpcError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let cleared = ids
            .iter()
            .filter(|id| self.settle(id, Err(error.clone())))
            .count();

        if cleared > 0 {
            warn!(cleared = cleared, error = %error, "Rejected all pending correlations");
        }
        cleared
    }

    fn settle(&self, id: &CorrelationId, settlement: Settlement) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                entry.timer.abort();
                debug!(
                    correlation_id = %id,
                    success = settlement.is_ok(),
                    waited_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "Settled correlation"
                );
                // The caller may have stopped waiting; the entry is settled either way.
                let _ = entry.sender.send(settlement);
                true
            }
            None => {
                debug!(correlation_id = %id, "Ignoring settlement for unknown correlation");
                false
            }
        }
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

fn spawn_timeout(
    pending: Weak<DashMap<CorrelationId, PendingEntry>>,
    id: CorrelationId,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let Some(pending) = pending.upgrade() else {
            return;
        };
        if let Some((_, entry)) = pending.remove(&id) {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(correlation_id = %id, timeout_ms = timeout_ms, "Correlation timed out");
            let _ = entry.sender.send(Err(RpcError::Timeout { id, timeout_ms }));
        }
    })
}

/// Future returned by [`CorrelationRegistry::register`], completing on settlement.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingResponse {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(settlement)) => Poll::Ready(settlement),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::TransportError(format!(
                "correlation {} dropped without settlement",
                self.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    fn data(byte: u8) -> ResponseData {
        ResponseData {
            data: vec![byte; 4].into(),
            width: 1,
            height: 1,
            quality: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_settles_once() {
        let registry = CorrelationRegistry::default();
        let id = CorrelationId::new("a");
        let mut pending = tokio_test::task::spawn(registry.register(id.clone()).unwrap());

        assert_pending!(pending.poll());
        assert!(registry.resolve(&id, data(1)));
        assert!(!registry.resolve(&id, data(2)));
        assert!(!registry.reject(&id, RpcError::RemoteError("late".into())));

        let settled = assert_ready!(pending.poll());
        assert_eq!(settled.unwrap(), data(1));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let registry = CorrelationRegistry::default();
        assert!(!registry.resolve(&CorrelationId::new("missing"), data(0)));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = CorrelationRegistry::default();
        let id = CorrelationId::new("dup");
        let _first = registry.register(id.clone()).unwrap();
        assert!(matches!(
            registry.register(id),
            Err(RpcError::DuplicateCorrelation(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_late_response_is_noop() {
        let registry = CorrelationRegistry::new(Duration::from_millis(20));
        let id = CorrelationId::new("slow");
        let pending = registry.register(id.clone()).unwrap();

        let settled = pending.await;
        assert!(matches!(settled, Err(RpcError::Timeout { timeout_ms: 20, .. })));
        assert!(!registry.is_pending(&id));
        assert!(!registry.resolve(&id, data(7)));
    }

    #[tokio::test]
    async fn test_clear_all_rejects_every_pending_entry() {
        let registry = CorrelationRegistry::default();
        let first = registry.register(CorrelationId::new("1")).unwrap();
        let second = registry.register(CorrelationId::new("2")).unwrap();

        let cleared = registry.clear_all(RpcError::TransportError("context crashed".into()));
        assert_eq!(cleared, 2);

        for pending in [first, second] {
            assert_eq!(
                pending.await,
                Err(RpcError::TransportError("context crashed".into()))
            );
        }
        assert_eq!(registry.clear_all(RpcError::TransportError("again".into())), 0);
    }
}
