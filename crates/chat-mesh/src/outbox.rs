//! Store-and-forward outbox for recipients that cannot be reached yet

use crate::message::{Message, PeerIdentity};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A queued message and when it entered the outbox
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: Message,
    pub enqueued_at: Instant,
}

/// Per-recipient FIFO of messages waiting for a path
///
/// Messages for one recipient leave in the order they were enqueued. A
/// recipient's entry is removed as soon as its queue empties. When a queue is
/// at capacity the oldest message is dropped to make room.
pub struct OutboxQueue {
    queues: HashMap<PeerIdentity, VecDeque<PendingMessage>>,
    max_per_recipient: usize,
    max_age: Duration,
}

impl OutboxQueue {
    /// Create a new outbox
    ///
    /// # Arguments
    /// * `max_per_recipient` - Maximum number of messages held per recipient
    /// * `max_age` - Messages older than this are discarded by `cleanup_expired`
    pub fn new(max_per_recipient: usize, max_age: Duration) -> Self {
        info!(
            "Initializing OutboxQueue with max_per_recipient={}, max_age={:?}",
            max_per_recipient, max_age
        );

        Self {
            queues: HashMap::new(),
            max_per_recipient: max_per_recipient.max(1),
            max_age,
        }
    }

    /// Append a message to its receiver's queue
    ///
    /// Always succeeds. Returns the message that was dropped to make room, if
    /// the queue was full.
    pub fn enqueue(&mut self, message: Message) -> Option<Message> {
        let recipient = message.receiver.clone();
        let queue = self.queues.entry(recipient.clone()).or_default();

        let dropped = if queue.len() >= self.max_per_recipient {
            queue.pop_front().map(|oldest| oldest.message)
        } else {
            None
        };

        if let Some(dropped) = &dropped {
            warn!(
                "Outbox full for {} (max {}), dropped oldest message {}",
                recipient, self.max_per_recipient, dropped.id
            );
        }

        debug!("Queued message {} for {}", message.id, recipient);
        queue.push_back(PendingMessage {
            message,
            enqueued_at: Instant::now(),
        });

        info!("Outbox for {} holds {} message(s)", recipient, queue.len());
        dropped
    }

    /// Remove and return everything queued for `recipient`, oldest first
    pub fn take(&mut self, recipient: &PeerIdentity) -> Vec<PendingMessage> {
        match self.queues.remove(recipient) {
            Some(queue) => {
                info!("Draining {} message(s) for {}", queue.len(), recipient);
                queue.into_iter().collect()
            }
            None => {
                debug!("No messages queued for {}", recipient);
                Vec::new()
            }
        }
    }

    /// Put messages that could not be flooded back at the head of the queue
    ///
    /// `pending` must be in enqueue order; it ends up ahead of anything queued
    /// for the same recipient in the meantime.
    pub fn requeue_front(&mut self, recipient: &PeerIdentity, pending: Vec<PendingMessage>) {
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        let queue = self.queues.entry(recipient.clone()).or_default();
        for item in pending.into_iter().rev() {
            queue.push_front(item);
        }

        while queue.len() > self.max_per_recipient {
            if let Some(oldest) = queue.pop_front() {
                warn!(
                    "Outbox full for {} on requeue, dropped oldest message {}",
                    recipient, oldest.message.id
                );
            }
        }

        debug!("Re-queued {} message(s) for {}", count, recipient);
    }

    /// Discard messages older than the configured maximum age
    ///
    /// Returns how many messages were removed. Empty queues are removed too.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let max_age = self.max_age;
        let mut total_removed = 0;

        self.queues.retain(|recipient, queue| {
            let before = queue.len();
            queue.retain(|pending| now.saturating_duration_since(pending.enqueued_at) <= max_age);
            let removed = before - queue.len();

            if removed > 0 {
                info!("Expired {} queued message(s) for {}", removed, recipient);
            }
            total_removed += removed;
            !queue.is_empty()
        });

        if total_removed > 0 {
            info!("Outbox cleanup removed {} expired message(s)", total_removed);
        } else {
            debug!("Outbox cleanup found nothing to expire");
        }

        total_removed
    }

    /// Recipients that currently have queued messages
    pub fn recipients(&self) -> Vec<PeerIdentity> {
        self.queues.keys().cloned().collect()
    }

    pub fn queue_len(&self, recipient: &PeerIdentity) -> usize {
        self.queues.get(recipient).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_messages(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn recipient_count(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Discard everything, returning how many messages were dropped
    pub fn clear(&mut self) -> usize {
        let total = self.total_messages();
        self.queues.clear();
        total
    }
}
