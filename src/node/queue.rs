use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Memory budget shared by every broker of a node. The counter only moves
/// under its lock; brokers take from it on enqueue and give back on write
/// completion or teardown.
pub struct MemoryPool {
    available: Mutex<usize>,
    capacity: usize,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.available.lock().expect("memory pool lock poisoned")
    }

    fn try_take(&self, bytes: usize) -> bool {
        let mut available = self.available.lock().expect("memory pool lock poisoned");
        if *available < bytes {
            return false;
        }
        *available -= bytes;
        true
    }

    fn give_back(&self, bytes: usize) {
        let mut available = self.available.lock().expect("memory pool lock poisoned");
        *available = (*available + bytes).min(self.capacity);
    }
}

struct QueueInner {
    payloads: VecDeque<Vec<u8>>,
    /// Bytes of the head payload already written to the socket.
    head_offset: usize,
    used: usize,
}

/// What an enqueue or dequeue did, so the broker can emit the matching
/// backpressure event.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueSignal {
    Accepted,
    /// Rejected: either cap would have been exceeded; carries the size.
    Rejected(usize),
    /// The queue just drained; carries the capacity freed since it filled.
    Drained(usize),
    /// Progress, but payloads remain queued.
    More,
}

/// Per-broker FIFO of owned byte buffers, bounded by the broker cap and by
/// the node-wide [`MemoryPool`].
///
/// Producers call `push` from any thread (short std lock); the broker task
/// drains with `peek`/`advance` after each socket write.
pub struct PayloadQueue {
    inner: Mutex<QueueInner>,
    pool: Arc<MemoryPool>,
    broker_cap: usize,
}

impl PayloadQueue {
    pub fn new(pool: Arc<MemoryPool>, broker_cap: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                payloads: VecDeque::new(),
                head_offset: 0,
                used: 0,
            }),
            pool,
            broker_cap,
        }
    }

    pub fn used(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").used
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .payloads
            .is_empty()
    }

    /// Copies a payload in. Fails fast when either the broker cap or the
    /// global pool would be exceeded; nothing is partially queued.
    pub fn push(&self, payload: Vec<u8>) -> QueueSignal {
        let bytes = payload.len();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.used + bytes > self.broker_cap {
            return QueueSignal::Rejected(bytes);
        }
        if !self.pool.try_take(bytes) {
            return QueueSignal::Rejected(bytes);
        }
        inner.used += bytes;
        inner.payloads.push_back(payload);
        QueueSignal::Accepted
    }

    /// The unwritten remainder of the head payload, copied out for the
    /// writer. `None` when the queue is idle.
    pub fn peek(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .payloads
            .front()
            .map(|head| head[inner.head_offset..].to_vec())
    }

    /// Records `written` bytes of the head as gone. The head is only popped
    /// once the transport reported it fully written.
    pub fn advance(&self, written: usize) -> QueueSignal {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let Some(head) = inner.payloads.front() else {
            return QueueSignal::More;
        };
        let head_len = head.len();
        inner.head_offset += written;
        if inner.head_offset < head_len {
            return QueueSignal::More;
        }
        inner.head_offset = 0;
        inner.payloads.pop_front();
        inner.used -= head_len;
        self.pool.give_back(head_len);
        if inner.payloads.is_empty() {
            let freed = self.broker_cap - inner.used;
            QueueSignal::Drained(freed)
        } else {
            QueueSignal::More
        }
    }

    /// Drops everything and returns the memory to the pool, e.g. on broker
    /// close. Returns the number of bytes freed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let freed = inner.used;
        inner.payloads.clear();
        inner.head_offset = 0;
        inner.used = 0;
        self.pool.give_back(freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_preserved() {
        let pool = MemoryPool::new(1024);
        let queue = PayloadQueue::new(pool, 1024);
        queue.push(b"first".to_vec());
        queue.push(b"second".to_vec());
        assert_eq!(queue.peek().unwrap(), b"first");
        assert_eq!(queue.advance(5), QueueSignal::More);
        assert_eq!(queue.peek().unwrap(), b"second");
        assert!(matches!(queue.advance(6), QueueSignal::Drained(_)));
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_partial_write_keeps_head() {
        let pool = MemoryPool::new(1024);
        let queue = PayloadQueue::new(pool, 1024);
        queue.push(b"abcdef".to_vec());
        assert_eq!(queue.advance(2), QueueSignal::More);
        // the consumed bytes are erased from the head
        assert_eq!(queue.peek().unwrap(), b"cdef");
        assert_eq!(queue.used(), 6);
        assert!(matches!(queue.advance(4), QueueSignal::Drained(_)));
        assert_eq!(queue.used(), 0);
    }

    #[test]
    fn test_broker_cap_rejects() {
        let pool = MemoryPool::new(1024);
        let queue = PayloadQueue::new(pool.clone(), 10);
        assert_eq!(queue.push(vec![0; 8]), QueueSignal::Accepted);
        assert_eq!(queue.push(vec![0; 3]), QueueSignal::Rejected(3));
        // the pool was not charged for the rejected payload
        assert_eq!(pool.available(), 1024 - 8);
    }

    #[test]
    fn test_global_cap_rejects_across_queues() {
        let pool = MemoryPool::new(10);
        let a = PayloadQueue::new(pool.clone(), 100);
        let b = PayloadQueue::new(pool.clone(), 100);
        assert_eq!(a.push(vec![0; 6]), QueueSignal::Accepted);
        assert_eq!(b.push(vec![0; 6]), QueueSignal::Rejected(6));
        assert_eq!(b.push(vec![0; 4]), QueueSignal::Accepted);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_size_invariant_holds() {
        // at all times: sum of per-broker used <= global cap - available
        let pool = MemoryPool::new(100);
        let queues: Vec<_> = (0..4)
            .map(|_| PayloadQueue::new(pool.clone(), 50))
            .collect();
        let mut accepted = 0usize;
        for (i, queue) in queues.iter().enumerate() {
            for _ in 0..10 {
                if queue.push(vec![i as u8; 7]) == QueueSignal::Accepted {
                    accepted += 7;
                }
                let used: usize = queues.iter().map(|q| q.used()).sum();
                assert_eq!(used, pool.capacity() - pool.available());
            }
        }
        assert!(accepted <= 100);
    }

    #[test]
    fn test_clear_returns_memory() {
        let pool = MemoryPool::new(100);
        let queue = PayloadQueue::new(pool.clone(), 100);
        queue.push(vec![0; 30]);
        queue.push(vec![0; 20]);
        assert_eq!(queue.clear(), 50);
        assert_eq!(pool.available(), 100);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drained_reports_freed_capacity() {
        let pool = MemoryPool::new(100);
        let queue = PayloadQueue::new(pool, 40);
        queue.push(vec![0; 10]);
        match queue.advance(10) {
            QueueSignal::Drained(freed) => assert_eq!(freed, 40),
            other => panic!("expected drained, got {:?}", other),
        }
    }
}
