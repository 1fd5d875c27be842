//! Fan-out of new captures to subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: when a
//! subscriber's queue is full the event is dropped for that subscriber only.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::types::CapturedRequest;

/// Queue depth used for listeners registered through `add_listener`
pub const DEFAULT_LISTENER_QUEUE: usize = 256;

/// Receives every capture added to the store after registration
#[async_trait]
pub trait CaptureListener: Send + Sync + 'static {
    async fn on_capture(&self, capture: Arc<CapturedRequest>);
}

#[async_trait]
impl<F> CaptureListener for F
where
    F: Fn(Arc<CapturedRequest>) + Send + Sync + 'static,
{
    async fn on_capture(&self, capture: Arc<CapturedRequest>) {
        self(capture)
    }
}

/// Opaque token returned on registration; pass it back to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    senders: DashMap<u64, mpsc::Sender<Arc<CapturedRequest>>>,
}

impl Listeners {
    pub(crate) fn subscribe(
        &self,
        capacity: usize,
    ) -> (ListenerHandle, mpsc::Receiver<Arc<CapturedRequest>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders.insert(id, tx);
        tracing::debug!(listener_id = id, "Registered capture listener");
        (ListenerHandle(id), rx)
    }

    /// Register a callback served by its own dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(&self, listener: Arc<dyn CaptureListener>) -> ListenerHandle {
        let (handle, mut rx) = self.subscribe(DEFAULT_LISTENER_QUEUE);
        tokio::spawn(async move {
            while let Some(capture) = rx.recv().await {
                listener.on_capture(capture).await;
            }
            tracing::debug!(listener_id = handle.0, "Capture listener dispatch stopped");
        });
        handle
    }

    pub(crate) fn remove(&self, handle: ListenerHandle) -> bool {
        let removed = self.senders.remove(&handle.0).is_some();
        if removed {
            tracing::debug!(listener_id = handle.0, "Removed capture listener");
        }
        removed
    }

    pub(crate) fn notify(&self, capture: &Arc<CapturedRequest>) {
        self.senders
            .retain(|id, sender| match sender.try_send(Arc::clone(capture)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        listener_id = *id,
                        capture_id = %capture.id,
                        "Listener queue full, dropping capture event"
                    );
                    true
                }
                // receiver dropped; forget the subscription
                Err(TrySendError::Closed(_)) => false,
            });
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
