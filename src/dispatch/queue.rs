//! Submission queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::item::QueuedItem;

/// Unbounded FIFO of items awaiting transmission.
///
/// Callers append from any thread; only the dispatcher worker pops. Retried
/// items are appended like new ones, so they go behind everything queued
/// since their first attempt.
pub struct SubmissionQueue<P> {
    items: Mutex<VecDeque<QueuedItem<P>>>,
}

impl<P> SubmissionQueue<P> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an item at the tail. Never blocks on anything but the lock.
    pub fn enqueue(&self, item: QueuedItem<P>) {
        self.items.lock().push_back(item);
    }

    /// Pop the head, if any.
    pub fn try_dequeue(&self) -> Option<QueuedItem<P>> {
        self.items.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

impl<P> Default for SubmissionQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}
