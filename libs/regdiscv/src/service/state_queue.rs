//! Bounded queue that favours the newest item.
//!
//! When the queue is more than half full, a push first discards the oldest
//! buffered item. The consumer therefore always makes progress towards the
//! latest state instead of replaying a backlog of stale ones.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Shared<T> {
    buf: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    discarded: AtomicU64,
    receiver_gone: AtomicBool,
    receiver_dropped: Notify,
}

/// Producer half. Dropping it closes the queue.
pub struct StateSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half.
pub struct StateReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a queue holding at most `capacity` items (minimum 2).
#[must_use]
pub fn state_queue<T>(capacity: usize) -> (StateSender<T>, StateReceiver<T>) {
    let capacity = capacity.max(2);
    let shared = Arc::new(Shared {
        buf: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity,
        closed: AtomicBool::new(false),
        discarded: AtomicU64::new(0),
        receiver_gone: AtomicBool::new(false),
        receiver_dropped: Notify::new(),
    });
    (
        StateSender {
            shared: Arc::clone(&shared),
        },
        StateReceiver { shared },
    )
}

impl<T> StateSender<T> {
    /// Push `item`, discarding the oldest buffered item when over half full.
    ///
    /// Returns `true` if an item was discarded.
    pub fn push(&self, item: T) -> bool {
        let discarded = {
            let mut buf = self.shared.buf.lock();
            let over_half = buf.len() * 2 > self.shared.capacity;
            if over_half {
                buf.pop_front();
            }
            buf.push_back(item);
            over_half
        };
        if discarded {
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        discarded
    }

    /// `true` once the receiver has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.receiver_gone.load(Ordering::Acquire)
    }

    /// Resolves once the receiver has been dropped.
    pub async fn closed(&self) {
        while !self.is_closed() {
            self.shared.receiver_dropped.notified().await;
        }
    }
}

impl<T> Drop for StateSender<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl<T> Drop for StateReceiver<T> {
    fn drop(&mut self) {
        self.shared.receiver_gone.store(true, Ordering::Release);
        self.shared.receiver_dropped.notify_one();
    }
}

impl<T> StateReceiver<T> {
    /// Next item, or `None` once the sender is gone and the queue drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.shared.buf.lock().pop_front() {
                return Some(item);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Number of items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.buf.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of items discarded by the producer so far.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_below_half() {
        let (tx, mut rx) = state_queue(10);
        assert!(!tx.push(1));
        assert!(!tx.push(2));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn discards_oldest_when_over_half_full() {
        let (tx, mut rx) = state_queue(4);
        for i in 0..10 {
            tx.push(i);
        }
        // never more than half + 1 items retained
        assert_eq!(rx.len(), 3);
        assert_eq!(rx.discarded(), 7);
        drop(tx);

        let mut drained = Vec::new();
        while let Some(v) = rx.recv().await {
            drained.push(v);
        }
        assert_eq!(drained, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn receiver_wakes_on_push_and_close() {
        let (tx, mut rx) = state_queue::<u32>(4);
        let waiter = tokio::spawn(async move {
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });
        tokio::task::yield_now().await;
        tx.push(42);
        drop(tx);
        assert_eq!(waiter.await.unwrap(), (Some(42), None));
    }

    #[test]
    fn sender_sees_dropped_receiver() {
        let (tx, rx) = state_queue::<u32>(4);
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn sender_wakes_when_receiver_dropped() {
        let (tx, rx) = state_queue::<u32>(4);
        let waiter = tokio::spawn(async move { tx.closed().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("sender must observe the dropped receiver")
            .unwrap();
    }
}
