//! Expiration schedule polled by the sweep task.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::sync::{Mutex, Notify};

/// Min-heap of `(expire_time, lease_id)`.
///
/// Entries are never removed on renew or revoke. A renewal pushes a newer
/// deadline, and the sweep discards popped entries that no longer match the
/// index.
#[derive(Debug, Default)]
pub(crate) struct ExpirationQueue {
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, String)>>>,
    changed: Notify,
}

impl ExpirationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schedule(&self, at: DateTime<Utc>, lease_id: String) {
        let mut heap = self.heap.lock().await;
        let earliest = heap.peek().map(|Reverse((t, _))| *t);
        heap.push(Reverse((at, lease_id)));
        drop(heap);

        if earliest.map_or(true, |t| at < t) {
            self.changed.notify_one();
        }
    }

    pub async fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().await.peek().map(|Reverse((t, _))| *t)
    }

    /// Remove and return every entry due at or before `now`.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, String)> {
        let mut heap = self.heap.lock().await;
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse((t, _))| *t <= now) {
            if let Some(Reverse(item)) = heap.pop() {
                due.push(item);
            }
        }
        due
    }

    /// Resolves when a deadline earlier than the current head is scheduled.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    pub async fn clear(&self) {
        self.heap.lock().await.clear();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }
}
