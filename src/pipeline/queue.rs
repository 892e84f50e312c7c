//! # Bounded Queue
//!
//! Fixed-capacity FIFO shared between request handlers and the aggregator thread.
//!
//! ## Contract:
//! - **Producers never block**: [`BoundedQueue::try_put`] hands the item back when the queue is full
//! - **Consumers wait a bounded time**: [`BoundedQueue::try_get`] returns `None` after `timeout`
//! - **Strict FIFO**: no priorities, no reordering
//!
//! ## Thread Safety:
//! A `Mutex<VecDeque<T>>` paired with a `Condvar`. Any number of threads may produce or
//! consume; the condition variable wakes a waiting consumer as soon as an item lands.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Result of [`BoundedQueue::put_or_evict_oldest`].
#[derive(Debug, PartialEq)]
pub enum PutOutcome<T> {
    /// Inserted without touching existing items.
    Inserted,
    /// The oldest item was dropped to make room, then the new one was inserted.
    EvictedOldest,
    /// Still full after one eviction; the item is handed back.
    Rejected(T),
}

pub struct BoundedQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items. `name` is used in log fields.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    // Every critical section leaves the deque consistent, so a poisoned lock
    // still guards valid data.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` unless the queue is at capacity. Never blocks.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive.
    pub fn try_get(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // Loop on spurious wakeups until the deadline passes
            let (guard, _) = self
                .not_empty
                .wait_timeout(items, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
        }
    }

    /// Pop the oldest item if there is one. Never blocks.
    pub fn try_get_now(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Feature-queue overflow policy: on a full queue evict exactly one oldest
    /// item and retry once. A second failure (another producer refilled the slot
    /// in between) hands the item back instead of looping.
    pub fn put_or_evict_oldest(&self, item: T) -> PutOutcome<T> {
        let item = match self.try_put(item) {
            Ok(()) => return PutOutcome::Inserted,
            Err(item) => item,
        };

        let evicted = self.try_get_now().is_some();
        match self.try_put(item) {
            Ok(()) if evicted => PutOutcome::EvictedOldest,
            Ok(()) => PutOutcome::Inserted,
            Err(item) => PutOutcome::Rejected(item),
        }
    }

    /// Remove every queued item, returning how many were dropped.
    pub fn drain_all(&self) -> usize {
        let mut items = self.lock();
        let count = items.len();
        items.clear();
        count
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
