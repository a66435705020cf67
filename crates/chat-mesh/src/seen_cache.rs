//! Bounded record of message ids already handled by this node

use crate::message::MessageId;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// A message id and when it was first observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenEntry {
    pub id: MessageId,
    pub first_seen: Instant,
}

#[derive(Default)]
struct SeenState {
    first_seen: HashMap<MessageId, Instant>,
    // Insertion order, oldest at the front
    order: VecDeque<SeenEntry>,
}

impl SeenState {
    fn purge_expired(&mut self, now: Instant, retention: Duration) -> usize {
        let mut purged = 0;
        while let Some(oldest) = self.order.front() {
            if now.saturating_duration_since(oldest.first_seen) <= retention {
                break;
            }
            self.first_seen.remove(&oldest.id);
            self.order.pop_front();
            purged += 1;
        }
        purged
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            self.first_seen.remove(&oldest.id);
        }
    }
}

/// Duplicate suppression for the flooding protocol
///
/// Entries older than the retention window are purged lazily whenever a new
/// id is inserted. The cache never holds more than `capacity` ids; when full,
/// the oldest id is evicted first.
pub struct SeenMessageCache {
    state: Mutex<SeenState>,
    retention: Duration,
    capacity: usize,
}

impl SeenMessageCache {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(SeenState::default()),
            retention,
            capacity: capacity.max(1),
        }
    }

    /// Record an observation of `id`
    ///
    /// Returns `true` the first time an id is observed within the retention
    /// window and `false` for every later observation. Check and insert happen
    /// under one lock, so two links racing on the same id cannot both win.
    pub async fn observe(&self, id: MessageId) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let purged = state.purge_expired(now, self.retention);
        if purged > 0 {
            debug!("Purged {} expired seen-message entries", purged);
        }

        if state.first_seen.contains_key(&id) {
            return false;
        }

        if state.order.len() >= self.capacity {
            state.evict_oldest();
        }

        state.first_seen.insert(id, now);
        state.order.push_back(SeenEntry { id, first_seen: now });
        true
    }

    /// Whether `id` is currently remembered
    pub async fn contains(&self, id: MessageId) -> bool {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .first_seen
            .get(&id)
            .map(|first_seen| now.saturating_duration_since(*first_seen) <= self.retention)
            .unwrap_or(false)
    }

    /// Snapshot of the entry for `id`, if remembered
    pub async fn entry(&self, id: MessageId) -> Option<SeenEntry> {
        let state = self.state.lock().await;
        state
            .first_seen
            .get(&id)
            .map(|first_seen| SeenEntry { id, first_seen: *first_seen })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}
