use std::{collections::VecDeque, time::Duration};

use tokio::sync::{Mutex, Notify};

/// An in-process FIFO with a blocking receive.
///
/// Backs the queue registry and single-host runs. Receivers park on a
/// `Notify` instead of polling, so a put wakes exactly one waiting receiver.
#[derive(Debug)]
pub struct LocalQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> LocalQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn put(&self, item: T) {
        self.items.lock().await.push_back(item);
        self.notify.notify_one();
    }

    /// Puts an item back at the head, for deliveries that never reached
    /// their receiver.
    pub async fn put_front(&self, item: T) {
        self.items.lock().await.push_front(item);
        self.notify.notify_one();
    }

    /// Waits until an item is available.
    ///
    /// The receiver registers as a waiter before it looks at the deque, so a
    /// put landing between the check and the wait still wakes it. When items
    /// are left behind the wakeup is passed on to the next receiver.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let mut items = self.items.lock().await;
            if let Some(item) = items.pop_front() {
                if !items.is_empty() {
                    self.notify.notify_one();
                }
                return item;
            }
            drop(items);
            notified.await;
        }
    }

    pub async fn try_get(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    pub async fn get_timeout(&self, timeout: Duration) -> Option<T> {
        if timeout.is_zero() {
            return self.try_get().await;
        }
        tokio::time::timeout(timeout, self.get()).await.ok()
    }

    pub async fn size(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Drops everything queued and returns how many items were dropped.
    pub async fn purge(&self) -> usize {
        let mut items = self.items.lock().await;
        let purged = items.len();
        items.clear();
        purged
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::poll;

    use super::*;

    #[tokio::test]
    async fn fifo_per_producer() {
        let queue = LocalQueue::new();
        for i in 0..5 {
            queue.put(i).await;
        }
        assert_eq!(queue.size().await, 5);
        for i in 0..5 {
            assert_eq!(queue.get().await, i);
        }
        assert_eq!(queue.try_get().await, None);
    }

    #[tokio::test]
    async fn get_wakes_on_put() {
        let queue = Arc::new(LocalQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put("item").await;
        assert_eq!(waiter.await.unwrap(), "item");
    }

    #[tokio::test]
    async fn get_timeout_returns_none_when_empty() {
        let queue: LocalQueue<u8> = LocalQueue::new();
        assert_eq!(queue.get_timeout(Duration::from_millis(10)).await, None);
        assert_eq!(queue.get_timeout(Duration::ZERO).await, None);
    }

    #[tokio::test]
    async fn every_item_reaches_exactly_one_of_many_receivers() {
        let queue = Arc::new(LocalQueue::new());
        let receivers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(item) = queue.get_timeout(Duration::from_millis(100)).await {
                        got.push(item);
                    }
                    got
                })
            })
            .collect();
        for i in 0..200u32 {
            queue.put(i).await;
        }
        let mut all = Vec::new();
        for receiver in receivers {
            all.extend(receiver.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn parked_receivers_each_get_one_of_two_puts() {
        let queue = LocalQueue::new();
        let mut first = Box::pin(queue.get());
        let mut second = Box::pin(queue.get());
        assert!(poll!(first.as_mut()).is_pending());
        assert!(poll!(second.as_mut()).is_pending());

        queue.put(1).await;
        queue.put(2).await;
        let mut got = vec![first.await, second.await];
        got.sort_unstable();
        assert_eq!(got, [1, 2]);
    }

    #[tokio::test]
    async fn wakeup_is_passed_on_while_items_remain() {
        let queue = LocalQueue::new();
        let mut first = Box::pin(queue.get());
        let mut second = Box::pin(queue.get());
        assert!(poll!(first.as_mut()).is_pending());
        assert!(poll!(second.as_mut()).is_pending());

        // two items behind a single wakeup, as when both puts land before
        // either receiver was registered
        {
            let mut items = queue.items.lock().await;
            items.push_back(1);
            items.push_back(2);
        }
        queue.notify.notify_one();
        let first = first.await;
        let second = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("second receiver was never woken");
        let mut got = vec![first, second];
        got.sort_unstable();
        assert_eq!(got, [1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_never_strand_a_receiver() {
        let queue = Arc::new(LocalQueue::new());
        for round in 0..2_000u32 {
            let receivers: Vec<_> = (0..2)
                .map(|_| {
                    let queue = queue.clone();
                    tokio::spawn(async move { queue.get().await })
                })
                .collect();
            let senders: Vec<_> = (0..2)
                .map(|i| {
                    let queue = queue.clone();
                    tokio::spawn(async move { queue.put(round * 2 + i).await })
                })
                .collect();
            for sender in senders {
                sender.await.unwrap();
            }
            for receiver in receivers {
                tokio::time::timeout(Duration::from_secs(5), receiver)
                    .await
                    .expect("receiver stranded with an item queued")
                    .unwrap();
            }
        }
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn purge_empties_the_queue() {
        let queue = LocalQueue::new();
        queue.put(1).await;
        queue.put(2).await;
        queue.put_front(0).await;
        assert_eq!(queue.try_get().await, Some(0));
        assert_eq!(queue.purge().await, 2);
        assert_eq!(queue.size().await, 0);
    }
}
