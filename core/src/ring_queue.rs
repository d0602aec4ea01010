//! Fixed-capacity, lock-free single-producer/single-consumer ring queue.
//!
//! The queue holds `N` slots and always keeps one of them empty, so a queue
//! created with `N` slots stores at most `N - 1` items:
//!
//! ```text
//!   head == tail                 -> empty
//!   (tail + 1) % N == head       -> full
//! ```
//!
//! The producer owns `tail` and the consumer owns `head`. Each side reads its
//! own index with relaxed ordering, publishes it with a release store, and
//! observes the other side's index with an acquire load. That is enough for
//! one producer thread and one consumer thread to run concurrently without
//! a lock.
//!
//! A [`RingQueue`] can be used directly from a single owner, or split into a
//! [`Producer`] and a [`Consumer`] that can be moved to different threads.
//! Neither half is `Clone`, so the single-producer/single-consumer contract
//! is enforced by ownership.
//!
//! # Example
//!
//! ```
//! use ember_core::ring_queue::RingQueue;
//!
//! let queue = RingQueue::<u32, 4>::new();
//! let (mut producer, mut consumer) = queue.split();
//!
//! assert!(producer.push(1).is_ok());
//! assert!(producer.push(2).is_ok());
//! assert_eq!(consumer.pop(), Some(1));
//! assert_eq!(consumer.peek(), Some(&2));
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared storage behind both queue halves.
struct Ring<T, const N: usize> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: slots are only touched by the single producer (at `tail`) and the
// single consumer (at `head`); the index protocol hands each slot over with
// release/acquire ordering, so sharing the ring only requires `T: Send`.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    const MIN_SLOTS: () = assert!(N >= 2, "a ring queue needs at least two slots");

    fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::MIN_SLOTS;

        Self {
            slots: (0..N)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn advance(index: usize) -> usize {
        (index + 1) % N
    }

    /// # Safety
    ///
    /// Must only be called from the single producer.
    unsafe fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = Self::advance(tail);
        if next == self.head.load(Ordering::Acquire) {
            return Err(item);
        }

        // SAFETY: the slot at `tail` is outside the consumer's readable range
        // until the release store below publishes it.
        unsafe { (*self.slots[tail].get()).write(item) };
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Must only be called from the single consumer.
    unsafe fn peek(&self) -> Option<&T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: `head != tail`, so the slot was initialized by a push that
        // happened-before the acquire load above.
        Some(unsafe { (*self.slots[head].get()).assume_init_ref() })
    }

    /// # Safety
    ///
    /// Must only be called from the single consumer.
    unsafe fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: same as `peek`; the slot is handed back to the producer by
        // the release store that follows, so it is read exactly once.
        let item = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.store(Self::advance(head), Ordering::Release);
        Some(item)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    fn is_full(&self) -> bool {
        Self::advance(self.tail.load(Ordering::Acquire)) == self.head.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + N - head) % N
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no producer or consumer is left.
        while unsafe { self.pop() }.is_some() {}
    }
}

/// A ring queue with `N` slots and a usable capacity of `N - 1` items.
///
/// All operations take `&mut self`; use [`RingQueue::split`] to hand the two
/// ends to different threads.
pub struct RingQueue<T, const N: usize> {
    ring: Ring<T, N>,
}

impl<T, const N: usize> RingQueue<T, N> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { ring: Ring::new() }
    }

    /// Append an item. Returns the item back if the queue is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        // SAFETY: `&mut self` makes this the only producer.
        unsafe { self.ring.push(item) }
    }

    /// Remove and return the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: `&mut self` makes this the only consumer.
        unsafe { self.ring.pop() }
    }

    /// Borrow the oldest item without removing it.
    pub fn peek(&self) -> Option<&T> {
        // SAFETY: a shared borrow excludes every `&mut self` producer/consumer call.
        unsafe { self.ring.peek() }
    }

    /// Drop the oldest item. Returns `false` if the queue was empty.
    pub fn dequeue(&mut self) -> bool {
        self.pop().is_some()
    }

    /// Drop every item and reset both indices to zero.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.ring.head.store(0, Ordering::Relaxed);
        self.ring.tail.store(0, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Number of items currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Maximum number of items the queue can hold (`N - 1`).
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Split the queue into a producer half and a consumer half.
    pub fn split(self) -> (Producer<T, N>, Consumer<T, N>) {
        let ring = Arc::new(self.ring);
        (
            Producer {
                ring: Arc::clone(&ring),
            },
            Consumer { ring },
        )
    }
}

impl<T, const N: usize> Default for RingQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> fmt::Debug for RingQueue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// The pushing end of a split [`RingQueue`].
pub struct Producer<T, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T, const N: usize> Producer<T, N> {
    /// Append an item. Returns the item back if the queue is full; never blocks.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        // SAFETY: `Producer` is not `Clone` and `push` takes `&mut self`.
        unsafe { self.ring.push(item) }
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub const fn capacity(&self) -> usize {
        N - 1
    }
}

impl<T, const N: usize> fmt::Debug for Producer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// The popping end of a split [`RingQueue`].
pub struct Consumer<T, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T, const N: usize> Consumer<T, N> {
    /// Remove and return the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: `Consumer` is not `Clone` and `pop` takes `&mut self`.
        unsafe { self.ring.pop() }
    }

    /// Borrow the oldest item without removing it.
    pub fn peek(&self) -> Option<&T> {
        // SAFETY: the borrow ends before any `&mut self` call can pop the slot.
        unsafe { self.ring.peek() }
    }

    /// Drop the oldest item. Returns `false` if the queue was empty.
    pub fn dequeue(&mut self) -> bool {
        self.pop().is_some()
    }

    /// Drop every item currently visible to the consumer.
    ///
    /// Only the consumer moves `head`, so clearing is done by draining.
    /// Items pushed concurrently after the drain started may remain.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub const fn capacity(&self) -> usize {
        N - 1
    }
}

impl<T, const N: usize> fmt::Debug for Consumer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_queue_is_empty() {
        let queue = RingQueue::<u32, 8>::new();
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.capacity(), 7);
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = RingQueue::<u32, 8>::new();
        for i in 0..7 {
            assert!(queue.push(i).is_ok());
        }
        for i in 0..7 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_push_into_full_queue_fails_and_keeps_state() {
        let mut queue = RingQueue::<u32, 4>::new();
        assert!(queue.push(10).is_ok());
        assert!(queue.push(11).is_ok());
        assert!(queue.push(12).is_ok());
        assert!(queue.is_full());

        assert_eq!(queue.push(13), Err(13));
        assert!(queue.is_full());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek(), Some(&10));

        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.pop(), Some(11));
        assert_eq!(queue.pop(), Some(12));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_queue_operations_fail() {
        let mut queue = RingQueue::<u32, 4>::new();
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.peek(), None);
        assert!(!queue.dequeue());
    }

    #[test]
    fn test_clear_then_is_empty() {
        let mut queue = RingQueue::<String, 4>::new();
        queue.push("a".into()).unwrap();
        queue.push("b".into()).unwrap();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        // Usable again after a clear.
        queue.push("c".into()).unwrap();
        assert_eq!(queue.pop().as_deref(), Some("c"));
    }

    #[test]
    fn test_wraparound_scenario_preserves_fifo() {
        let mut queue = RingQueue::<u32, 4>::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));

        queue.push(4).unwrap();
        queue.push(5).unwrap();
        assert!(queue.is_full());

        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(5));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_drops_head() {
        let mut queue = RingQueue::<u32, 4>::new();
        queue.push(7).unwrap();
        queue.push(8).unwrap();
        assert!(queue.dequeue());
        assert_eq!(queue.peek(), Some(&8));
    }

    #[test]
    fn test_drop_releases_remaining_items() {
        let marker = Arc::new(());
        {
            let mut queue = RingQueue::<Arc<()>, 8>::new();
            for _ in 0..5 {
                queue.push(Arc::clone(&marker)).unwrap();
            }
            queue.pop();
            assert_eq!(Arc::strong_count(&marker), 5);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_split_halves_share_state() {
        let (mut producer, mut consumer) = RingQueue::<u32, 4>::new().split();
        producer.push(1).unwrap();
        producer.push(2).unwrap();
        producer.push(3).unwrap();
        assert!(producer.is_full());
        assert!(consumer.is_full());
        assert_eq!(producer.push(4), Err(4));

        assert_eq!(consumer.peek(), Some(&1));
        assert!(consumer.dequeue());
        assert_eq!(consumer.len(), 2);

        consumer.clear();
        assert!(consumer.is_empty());
        assert!(producer.is_empty());
    }

    #[test]
    fn test_concurrent_spsc_preserves_order() {
        const COUNT: u64 = 100_000;
        let (mut producer, mut consumer) = RingQueue::<u64, 64>::new().split();

        let writer = std::thread::spawn(move || {
            let mut next = 0;
            while next < COUNT {
                if producer.push(next).is_ok() {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match consumer.pop() {
                Some(value) => {
                    assert_eq!(value, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }

        writer.join().unwrap();
        assert!(consumer.is_empty());
    }
}
