//! Single-flight coalescing dispatcher.
//!
//! Producers push items and call `dispatch`; at most one drain runs at a time
//! per queue, so items are handled sequentially and in push order even though
//! the drain itself runs on a shared pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;

use super::pool::WorkerPool;

/// Queue of pending items plus the "drain scheduled" flag.
pub(crate) struct PendingEvents<T> {
    queue: SegQueue<T>,
    armed: AtomicBool,
}

impl<T> PendingEvents<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            armed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, item: T) {
        self.queue.push(item);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a drain is scheduled or running.
    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn try_arm(&self) -> bool {
        self.armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drain the queue; the caller must hold the flag.
    ///
    /// After clearing the flag the queue is checked once more: an item pushed
    /// between the last pop and the clear would otherwise wait for an
    /// unrelated dispatch. Draining again requires winning the flag back, so
    /// two drains never overlap.
    fn run_armed(&self, handler: &mut impl FnMut(T)) {
        loop {
            while let Some(item) = self.queue.pop() {
                handler(item);
            }
            self.armed.store(false, Ordering::Release);
            if self.queue.is_empty() || !self.try_arm() {
                break;
            }
        }
    }

    /// Drain on the calling thread unless a drain is already in flight.
    ///
    /// Returns `false` when another drain owns the queue; that drain will
    /// deliver whatever is queued now.
    pub(crate) fn drain_if_idle(&self, mut handler: impl FnMut(T)) -> bool {
        if !self.try_arm() {
            return false;
        }
        self.run_armed(&mut handler);
        true
    }
}

impl<T: Send + 'static> PendingEvents<T> {
    /// Schedule a drain on `pool` unless one is already scheduled or running.
    pub(crate) fn dispatch<F>(self: &Arc<Self>, pool: &WorkerPool, mut handler: F)
    where
        F: FnMut(T) + Send + 'static,
    {
        if !self.try_arm() {
            return;
        }
        let me = Arc::clone(self);
        pool.execute(Box::new(move || me.run_armed(&mut handler)));
    }
}
