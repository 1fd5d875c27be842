use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::filter::matches_filter;
use super::listener::{CaptureListener, ListenerHandle, Listeners};
use super::types::{CaptureStats, CapturedRequest, FilterOptions};

/// Fixed-capacity ring of captures, newest first on read.
pub struct CaptureStore {
    ring: RwLock<Ring>,
    listeners: Listeners,
}

struct Ring {
    slots: Vec<Option<Arc<CapturedRequest>>>,
    /// Next slot to write
    head: usize,
    count: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            head: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, capture: Arc<CapturedRequest>) {
        let cap = self.capacity();
        self.slots[self.head] = Some(capture);
        self.head = (self.head + 1) % cap;
        if self.count < cap {
            self.count += 1;
        }
    }

    fn newest_first(&self) -> impl Iterator<Item = &Arc<CapturedRequest>> + '_ {
        let cap = self.capacity();
        (0..self.count).filter_map(move |i| self.slots[(self.head + cap - 1 - i) % cap].as_ref())
    }
}

impl CaptureStore {
    /// Create a store holding at most `capacity` captures (minimum one)
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring::new(capacity.max(1))),
            listeners: Listeners::default(),
        }
    }

    /// Insert a capture, evicting the oldest when full.
    ///
    /// Fills in a fresh id and the current time when the capture lacks them.
    /// Listeners are notified after the write lock is released.
    pub async fn add(&self, mut capture: CapturedRequest) -> Arc<CapturedRequest> {
        if capture.id.is_empty() {
            capture.id = Uuid::new_v4().to_string();
        }
        let capture = {
            let mut ring = self.ring.write().await;
            // stamped under the lock so ring order and time order agree
            if capture.timestamp == DateTime::<Utc>::UNIX_EPOCH {
                capture.timestamp = Utc::now();
            }
            let capture = Arc::new(capture);
            ring.push(Arc::clone(&capture));
            capture
        };

        tracing::debug!(
            capture_id = %capture.id,
            method = %capture.method,
            url = %capture.url,
            status = capture.status_code,
            "Stored capture"
        );

        self.listeners.notify(&capture);
        capture
    }

    pub async fn get(&self, id: &str) -> Option<Arc<CapturedRequest>> {
        self.ring
            .read()
            .await
            .newest_first()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Captures matching `filter`, most recent first, after `offset` and up
    /// to `limit`.
    pub async fn list(&self, filter: &FilterOptions) -> Vec<Arc<CapturedRequest>> {
        let ring = self.ring.read().await;
        let matching = ring
            .newest_first()
            .filter(|c| matches_filter(c, filter))
            .skip(filter.offset)
            .cloned();

        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub async fn stats(&self) -> CaptureStats {
        let ring = self.ring.read().await;
        let mut stats = CaptureStats::default();
        let mut total_duration = Duration::ZERO;

        for capture in ring.newest_first() {
            stats.total_count += 1;
            stats.total_request_size += capture.request_size;
            stats.total_response_size += capture.response_size;
            *stats.by_method.entry(capture.method.clone()).or_default() += 1;
            *stats.by_status.entry(capture.status_code).or_default() += 1;
            *stats.by_host.entry(capture.host.clone()).or_default() += 1;
            total_duration += capture.duration;

            if stats.oldest.map_or(true, |t| capture.timestamp < t) {
                stats.oldest = Some(capture.timestamp);
            }
            if stats.newest.map_or(true, |t| capture.timestamp > t) {
                stats.newest = Some(capture.timestamp);
            }
        }

        if stats.total_count > 0 {
            stats.avg_duration = total_duration / stats.total_count as u32;
        }
        stats
    }

    pub async fn clear(&self) {
        let mut ring = self.ring.write().await;
        let capacity = ring.capacity();
        *ring = Ring::new(capacity);
        tracing::info!("Cleared capture store");
    }

    pub async fn count(&self) -> usize {
        self.ring.read().await.count
    }

    pub async fn capacity(&self) -> usize {
        self.ring.read().await.capacity()
    }

    /// Register a callback; it runs on a dedicated task fed by a bounded queue
    pub fn add_listener(&self, listener: Arc<dyn CaptureListener>) -> ListenerHandle {
        self.listeners.spawn(listener)
    }

    /// Subscribe as a channel instead of a callback
    pub fn subscribe(
        &self,
        capacity: usize,
    ) -> (ListenerHandle, mpsc::Receiver<Arc<CapturedRequest>>) {
        self.listeners.subscribe(capacity)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
