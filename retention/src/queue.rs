//! Time-ordered queue of pending requests.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::binary_heap::PeekMut;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

use crate::pending::PendingRequest;
use crate::row::RowKey;

/// Heap entry ordered by flush time, then row key.
struct Scheduled(Arc<PendingRequest>);

impl Scheduled {
    fn sort_key(&self) -> (Instant, &RowKey) {
        (self.0.flush_at(), self.0.key())
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: `BinaryHeap` is a max-heap and the earliest request must
    // come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.sort_key().cmp(&self.sort_key())
    }
}

/// A queue of pending requests that releases each one once its flush time
/// has been reached.
#[derive(Default)]
pub struct DelayQueue {
    heap: Mutex<BinaryHeap<Scheduled>>,
    notify: Notify,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `request` for its flush time.
    pub fn put(&self, request: Arc<PendingRequest>) {
        let mut heap = self.heap.lock();
        let earliest = heap
            .peek()
            .is_none_or(|head| request.flush_at() < head.0.flush_at());
        heap.push(Scheduled(request));
        drop(heap);

        // A waiting `take` only needs waking if its deadline moved earlier.
        if earliest {
            self.notify.notify_one();
        }
    }

    /// Waits for the earliest request to become due, then removes and
    /// returns it.
    ///
    /// Cancel safe: a request is only removed from the queue when it is
    /// returned.
    pub async fn take(&self) -> Arc<PendingRequest> {
        loop {
            let deadline = {
                let now = Instant::now();
                let mut heap = self.heap.lock();
                if let Some(head) = heap.peek_mut()
                    && head.0.flush_at() <= now
                {
                    return PeekMut::pop(head).0;
                }
                heap.peek().map(|head| head.0.flush_at())
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Removes `request` if it is still queued. Returns whether it was.
    pub fn remove(&self, request: &Arc<PendingRequest>) -> bool {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|scheduled| !Arc::ptr_eq(&scheduled.0, request));
        heap.len() != before
    }

    /// Removes and returns the earliest request, due or not.
    pub fn pop(&self) -> Option<Arc<PendingRequest>> {
        self.heap.lock().pop().map(|scheduled| scheduled.0)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
