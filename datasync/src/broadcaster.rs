//! Fan-out of status values to any number of subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing waits for room in each
//! queue, so a subscriber must keep draining its queue or unsubscribe;
//! abandoning a live subscription eventually stalls the publisher. Status
//! values are rare, and losing one is worse than waiting for a slow reader.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Capacity of each subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next value. `None` once the subscription was removed or
    /// the broadcaster shut down and every queued value has been read.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::Sender<T>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Broadcaster {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a subscriber. After shutdown the returned subscription is already
    /// closed.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut subscribers = self.subscribers.lock();
        if !self.closed.load(Ordering::Acquire) {
            subscribers.push((id, tx));
        }
        Subscription { id, rx }
    }

    /// Removes a subscriber and closes its queue. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn has_subscribers(&self) -> bool {
        let mut subscribers = self.subscribers.lock();
        prune_dropped(&mut subscribers);
        !subscribers.is_empty()
    }

    /// Delivers `value` to every current subscriber.
    pub async fn publish(&self, value: T) {
        let senders: Vec<mpsc::Sender<T>> = {
            let mut subscribers = self.subscribers.lock();
            prune_dropped(&mut subscribers);
            subscribers.iter().map(|(_, tx)| tx.clone()).collect()
        };

        for tx in senders {
            // The receiver may have been dropped since the snapshot.
            let _ = tx.send(value.clone()).await;
        }
    }

    /// Closes every subscriber queue. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut subscribers = self.subscribers.lock();
        self.closed.store(true, Ordering::Release);
        subscribers.clear();
    }
}

/// Forgets subscriptions whose receiving end was dropped without
/// unsubscribing.
fn prune_dropped<T>(subscribers: &mut Vec<(SubscriptionId, mpsc::Sender<T>)>) {
    subscribers.retain(|(_, tx)| !tx.is_closed());
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert!(broadcaster.has_subscribers());

        broadcaster.publish("one").await;
        broadcaster.publish("two").await;

        assert_eq!(a.recv().await, Some("one"));
        assert_eq!(a.recv().await, Some("two"));
        assert_eq!(b.recv().await, Some("one"));
        assert_eq!(b.recv().await, Some("two"));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_queue() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish(1).await;
        broadcaster.unsubscribe(a.id());
        broadcaster.publish(2).await;

        // Values queued before removal are still readable.
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_forgotten() {
        let broadcaster = Broadcaster::new();
        let mut kept = broadcaster.subscribe();
        let dropped = broadcaster.subscribe();
        drop(dropped);

        broadcaster.publish(1).await;
        assert_eq!(broadcaster.subscribers.lock().len(), 1);
        assert_eq!(kept.recv().await, Some(1));

        drop(kept);
        assert!(!broadcaster.has_subscribers());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe();

        broadcaster.shutdown();
        broadcaster.shutdown();
        assert!(!broadcaster.has_subscribers());
        assert_eq!(a.recv().await, None);

        let mut late = broadcaster.subscribe();
        broadcaster.publish(5).await;
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_publisher_until_drained() {
        let broadcaster = Arc::new(Broadcaster::new());
        let mut sub = broadcaster.subscribe();
        for i in 0..SUBSCRIBER_QUEUE_CAPACITY {
            broadcaster.publish(i).await;
        }

        let publisher = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.publish(99).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        assert_eq!(sub.recv().await, Some(0));
        publisher.await.unwrap();
        for i in 1..SUBSCRIBER_QUEUE_CAPACITY {
            assert_eq!(sub.recv().await, Some(i));
        }
        assert_eq!(sub.recv().await, Some(99));
    }
}
