//! # Bounded Queue
//!
//! Fixed-capacity FIFO between a producer that must never block (a serial
//! reader task) and a consumer that waits with a timeout.
//!
//! When full, pushing evicts the oldest item. The queue can be closed, or
//! failed with a message; in both cases items already queued are still
//! delivered first.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Outcome of [`BoundedQueue::pop`]
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    TimedOut,
    Closed,
    Failed(String),
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    evicted: u64,
    closed: bool,
    failure: Option<String>,
}

/// Drop-oldest bounded queue.
///
/// # Examples
///
/// ```
/// use telemon::serial::queue::BoundedQueue;
///
/// let queue = BoundedQueue::new(2);
/// queue.push(1);
/// queue.push(2);
/// assert!(queue.push(3)); // evicts 1
/// assert_eq!(queue.try_pop(), Some(2));
/// ```
#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                evicted: 0,
                closed: false,
                failure: None,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest one if the queue is full.
    ///
    /// Returns `true` if an item was evicted. Items pushed after
    /// [`close`](Self::close) are discarded.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let evicted = state.items.len() >= self.capacity;
            if evicted {
                state.items.pop_front();
                state.evicted += 1;
            }
            state.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Take the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Wait up to `timeout` for the oldest item.
    ///
    /// Queued items are returned before `Closed` or `Failed` is reported.
    pub async fn pop(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    return Pop::Item(item);
                }
                if let Some(message) = &state.failure {
                    return Pop::Failed(message.clone());
                }
                if state.closed {
                    return Pop::Closed;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Pop::TimedOut;
            }
        }
    }

    /// Stop accepting items and wake waiters
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Record a producer failure and wake waiters.
    ///
    /// The first failure wins; later ones are ignored.
    pub fn fail(&self, message: impl Into<String>) {
        {
            let mut state = self.lock();
            if state.failure.is_none() {
                state.failure = Some(message.into());
            }
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items dropped because the queue was full
    pub fn evicted_count(&self) -> u64 {
        self.lock().evicted
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_drop_oldest_keeps_newest_capacity_items() {
        let capacity = 8;
        let overflow = 5;
        let queue = BoundedQueue::new(capacity);

        for i in 0..capacity + overflow {
            queue.push(i);
        }

        assert_eq!(queue.len(), capacity);
        assert_eq!(queue.evicted_count(), overflow as u64);
        let drained: Vec<usize> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, (overflow..capacity + overflow).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let queue = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(!queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[test]
    fn test_push_after_close_is_discarded() {
        let queue = BoundedQueue::new(2);
        queue.close();
        queue.push(1);
        assert!(queue.is_empty());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_pop_times_out() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(2);
        let result = queue.pop(Duration::from_millis(20)).await;
        assert_eq!(result, Pop::TimedOut);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(2));
        let producer = Arc::clone(&queue);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(42);
        });

        assert_eq!(queue.pop(Duration::from_secs(5)).await, Pop::Item(42));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let queue: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new(2));
        let closer = Arc::clone(&queue);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        assert_eq!(queue.pop(Duration::from_secs(5)).await, Pop::Closed);
    }

    #[tokio::test]
    async fn test_failure_reported_after_items_drain() {
        let queue = BoundedQueue::new(4);
        queue.push(1);
        queue.fail("device unplugged");
        queue.fail("ignored");

        assert_eq!(queue.pop(Duration::from_millis(10)).await, Pop::Item(1));
        assert_eq!(
            queue.pop(Duration::from_millis(10)).await,
            Pop::Failed("device unplugged".to_string())
        );
    }
}
