//! Fixed-capacity circular buffer shared between threads.
//!
//! `put` and `get` are test-and-act primitives: they never wait for space or
//! for an item. Callers that need to wait layer their own condition variable
//! (dispatcher) or retry loop (acceptor) on top.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Returned by [`BoundedQueue::put`] when every slot is occupied.
/// Hands the rejected item back so the caller can retry with it.
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
}

impl<T> Ring<T> {
    // head == tail is ambiguous on its own; the slot under head tells full from empty.
    fn is_full(&self) -> bool {
        self.head == self.tail && self.slots[self.head].is_some()
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail && self.slots[self.head].is_none()
    }

    fn len(&self) -> usize {
        let capacity = self.slots.len();
        if self.is_full() {
            capacity
        } else {
            (self.tail + capacity - self.head) % capacity
        }
    }
}

/// Thread-safe FIFO ring of at most `capacity` items, guarded by one mutex.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue.
    ///
    /// # Errors
    /// `Error::InvalidCapacity` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 1 {
            return Err(Error::InvalidCapacity(capacity));
        }
        let slots: Vec<Option<T>> = (0..capacity).map(|_| None).collect();
        Ok(Self {
            ring: Mutex::new(Ring {
                slots: slots.into_boxed_slice(),
                head: 0,
                tail: 0,
            }),
            capacity,
        })
    }

    /// Insert at the tail. Fails immediately if the queue is full.
    pub fn put(&self, item: T) -> core::result::Result<(), QueueFull<T>> {
        let mut ring = self.ring.lock();
        if ring.is_full() {
            return Err(QueueFull(item));
        }
        let tail = ring.tail;
        ring.slots[tail] = Some(item);
        ring.tail = (tail + 1) % self.capacity;
        Ok(())
    }

    /// Remove from the head. Returns `None` immediately if the queue is empty.
    pub fn get(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        let head = ring.head;
        let item = ring.slots[head].take()?;
        ring.head = (head + 1) % self.capacity;
        Some(item)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Run `f` with the length while the queue stays locked, so the count can be
    /// combined with others into one snapshot.
    pub(crate) fn with_len<R>(&self, f: impl FnOnce(usize) -> R) -> R {
        let ring = self.ring.lock();
        f(ring.len())
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            BoundedQueue::<u32>::new(0),
            Err(Error::InvalidCapacity(0))
        ));
    }

    #[test]
    fn get_on_empty_returns_none() {
        let q = BoundedQueue::<u32>::new(3).expect("queue");
        assert!(q.is_empty());
        assert_eq!(q.get(), None);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn items_come_out_in_fifo_order() {
        let q = BoundedQueue::new(4).expect("queue");
        for i in 0..4 {
            q.put(i).expect("put");
        }
        assert_eq!((0..4).map(|_| q.get().unwrap()).collect::<Vec<_>>(), [0, 1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn put_on_full_hands_item_back() {
        let q = BoundedQueue::new(2).expect("queue");
        q.put("a").expect("put");
        q.put("b").expect("put");
        assert!(q.is_full());
        assert_eq!(q.len(), 2);
        let rejected = q.put("c").expect_err("queue should be full");
        assert_eq!(rejected.into_inner(), "c");
        // Contents untouched by the failed put.
        assert_eq!(q.get(), Some("a"));
        assert_eq!(q.get(), Some("b"));
        assert_eq!(q.get(), None);
    }

    #[test]
    fn capacity_one_alternates_full_and_empty() {
        let q = BoundedQueue::new(1).expect("queue");
        for i in 0..5 {
            assert!(q.is_empty());
            q.put(i).expect("put");
            assert!(q.is_full());
            assert!(q.put(100).is_err());
            assert_eq!(q.get(), Some(i));
        }
    }

    #[test]
    fn wraparound_keeps_order_and_len() {
        let q = BoundedQueue::new(3).expect("queue");
        let mut next_in = 0;
        let mut next_out = 0;
        for _ in 0..10 {
            q.put(next_in).expect("put");
            next_in += 1;
            q.put(next_in).expect("put");
            next_in += 1;
            assert_eq!(q.len(), 2);
            assert_eq!(q.get(), Some(next_out));
            next_out += 1;
            assert_eq!(q.get(), Some(next_out));
            next_out += 1;
            assert_eq!(q.len(), 0);
        }
    }

    #[test]
    fn outstanding_items_never_exceed_capacity() {
        let q = BoundedQueue::new(5).expect("queue");
        let mut held = 0usize;
        // Deterministic pseudo-random put/get mix.
        let mut x: u32 = 0x2545_f491;
        for i in 0..1000 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            if x % 3 == 0 {
                if q.get().is_some() {
                    held -= 1;
                }
            } else if q.put(i).is_ok() {
                held += 1;
            }
            assert!(held <= 5);
            assert_eq!(q.len(), held);
        }
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let q = Arc::new(BoundedQueue::new(8).expect("queue"));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        while let Err(full) = q.put(item) {
                            item = full.into_inner();
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while seen.len() < PRODUCERS * PER_PRODUCER / 2 {
                        match q.get() {
                            Some(item) => seen.push(item),
                            None => thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().expect("producer");
        }
        let mut all = HashSet::new();
        for c in consumers {
            for item in c.join().expect("consumer") {
                assert!(all.insert(item), "item {item} delivered twice");
            }
        }
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        assert!(q.is_empty());
    }
}
