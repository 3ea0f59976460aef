//! Packet queues handing ordered payloads from the sequencer to readers.
//!
//! A [`PacketQueue`] is a FIFO of delivered payload chunks for one virtual
//! connection plus an "arrived" notification and a closed flag. Once closed it
//! accepts no more payloads, but buffered payloads are still popped until the
//! queue is empty.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::sequencer::ConnKey;

/// Queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Packet queue {0} is closed")]
    Closed(ConnKey),
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Bytes>,
    closed: bool,
}

/// FIFO of delivered payloads for one virtual connection
#[derive(Debug)]
pub struct PacketQueue {
    key: ConnKey,
    state: Mutex<QueueState>,
    arrived: Notify,
}

impl PacketQueue {
    pub fn new(key: ConnKey) -> Self {
        Self {
            key,
            state: Mutex::new(QueueState::default()),
            arrived: Notify::new(),
        }
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    /// Append a delivered payload and wake waiting readers.
    pub fn push(&self, payload: Bytes) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(self.key));
            }
            state.items.push_back(payload);
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    /// Take the oldest buffered payload, if any.
    pub fn pop(&self) -> Option<Bytes> {
        self.state.lock().items.pop_front()
    }

    /// Whether at least one payload is buffered
    pub fn has_arrived(&self) -> bool {
        !self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closed and fully drained
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Wait until a payload is buffered or the queue is closed.
    ///
    /// Cancel-safe: callers may race it against a deadline.
    pub async fn wait_for_arrived(&self) {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.closed || !state.items.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Mark closed and wake every waiter. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.arrived.notify_waiters();
    }
}

/// Registry of packet queues by connection
#[derive(Debug, Default)]
pub struct PacketQueues {
    queues: RwLock<HashMap<ConnKey, Arc<PacketQueue>>>,
}

impl PacketQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the queue for `key`. Idempotent.
    pub fn create(&self, key: ConnKey) -> Arc<PacketQueue> {
        let mut queues = self.queues.write();
        Arc::clone(
            queues
                .entry(key)
                .or_insert_with(|| Arc::new(PacketQueue::new(key))),
        )
    }

    pub fn get(&self, key: ConnKey) -> Option<Arc<PacketQueue>> {
        self.queues.read().get(&key).cloned()
    }

    /// Close the queue for `key` and drop it from the registry.
    ///
    /// Readers holding the queue can still drain what is buffered.
    pub fn remove(&self, key: ConnKey) -> Option<Arc<PacketQueue>> {
        let queue = self.queues.write().remove(&key);
        if let Some(queue) = &queue {
            queue.close();
        }
        queue
    }

    /// Close and drop every queue, waking all readers.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.queues.write().drain().map(|(_, q)| q).collect();
        for queue in drained {
            queue.close();
        }
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const KEY: ConnKey = ConnKey {
        sender_id: 1,
        conn_id: 1,
    };

    #[test]
    fn test_fifo_order() {
        let q = PacketQueue::new(KEY);
        q.push(Bytes::from_static(b"a")).unwrap();
        q.push(Bytes::from_static(b"b")).unwrap();

        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"b"));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_close_keeps_buffered_data() {
        let q = PacketQueue::new(KEY);
        q.push(Bytes::from_static(b"tail")).unwrap();
        q.close();

        assert!(q.is_closed());
        assert!(!q.is_finished());
        assert_eq!(
            q.push(Bytes::from_static(b"late")),
            Err(QueueError::Closed(KEY))
        );

        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"tail"));
        assert!(q.pop().is_none());
        assert!(q.is_finished());
    }

    #[tokio::test]
    async fn test_wait_for_arrived_wakes_on_push() {
        let q = Arc::new(PacketQueue::new(KEY));

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.wait_for_arrived().await;
                q.pop()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(Bytes::from_static(b"x")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
        assert_eq!(got.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_wait_for_arrived_wakes_on_close() {
        let q = Arc::new(PacketQueue::new(KEY));

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_for_arrived().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_ready() {
        let q = PacketQueue::new(KEY);
        q.push(Bytes::from_static(b"ready")).unwrap();
        tokio::time::timeout(Duration::from_millis(100), q.wait_for_arrived())
            .await
            .expect("should not block");
    }

    #[test]
    fn test_registry_create_is_idempotent() {
        let queues = PacketQueues::new();
        let a = queues.create(KEY);
        let b = queues.create(KEY);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(queues.len(), 1);

        let removed = queues.remove(KEY).unwrap();
        assert!(removed.is_closed());
        assert!(queues.get(KEY).is_none());
        assert!(queues.is_empty());
    }

    #[test]
    fn test_registry_close_all() {
        let queues = PacketQueues::new();
        let a = queues.create(KEY);
        let b = queues.create(ConnKey::new(2, 9));

        queues.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(queues.is_empty());
    }
}
