use crate::cache_pad::CacheAligned;
use crate::{Backoff, Config, EnumerationError, Metrics, MetricsSnapshot};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// Multi-producer / single-consumer bounded ring (spec.md §4.2)
// =============================================================================
//
// This is a genuinely different shape from a decomposed per-producer ring:
// every producer races to claim the next slot in ONE shared buffer via CAS on
// `enqueue_pos` ("Tail"). Each slot carries its own `sequence` counter
// (Dmitry Vyukov's bounded MPMC design) so a producer can tell, without
// touching `dequeue_pos`, whether the slot it is about to claim has been
// vacated by the consumer yet.
//
// The consumer side needs no CAS: there is exactly one consumer, so
// `dequeue_pos` ("Head") only ever moves under that single thread and a plain
// atomic store is enough to publish the move to producers.
//
// Slot protocol (both ends use it; only the producer side needs a CAS):
//
//   enqueue: dif = slot.sequence - pos
//     dif == 0  -> slot is free for `pos`; CAS enqueue_pos, write, then
//                  store slot.sequence = pos + 1 (Release)
//     dif  < 0  -> queue is full
//     dif  > 0  -> another producer already claimed this slot; retry
//
//   dequeue: dif = slot.sequence - (pos + 1)
//     dif == 0  -> slot holds a committed item for `pos`; read it, then
//                  store slot.sequence = pos + capacity (Release), freeing
//                  the slot for the producer cycle after next
//     dif  < 0  -> queue is empty

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer/single-consumer queue (spec.md §4.2).
pub struct Mpsc<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CacheAligned<AtomicUsize>,
    dequeue_pos: CacheAligned<AtomicUsize>,
    metrics: Metrics,
    config: Config,
}

unsafe impl<T: Send> Send for Mpsc<T> {}
unsafe impl<T: Send> Sync for Mpsc<T> {}

impl<T> Mpsc<T> {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let capacity = config.capacity();
        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CacheAligned::new(AtomicUsize::new(0)),
            dequeue_pos: CacheAligned::new(AtomicUsize::new(0)),
            metrics: Metrics::new(),
            config,
        }
    }

    /// Builds a queue pre-seeded with `items`, in order.
    ///
    /// # Panics
    ///
    /// Panics if `items` yields more elements than the rounded-up capacity.
    #[must_use]
    pub fn new_from(capacity: usize, items: impl IntoIterator<Item = T>) -> Self {
        let queue = Self::new(Config::new(capacity, false));
        for item in items {
            assert!(queue.try_enqueue(item), "seed sequence exceeds queue capacity");
        }
        queue
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Claims a slot and writes `item`. Returns `false` if the queue is
    /// full. Spins briefly under producer-producer contention on the same
    /// slot before retrying.
    pub fn try_enqueue(&self, item: T) -> bool {
        let mut item = MaybeUninit::new(item);
        let mut backoff = Backoff::new();

        loop {
            let pos = self.enqueue_pos.load(Ordering::Relaxed);
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;

            if dif == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // SAFETY: winning the CAS makes us the sole writer of
                    // this slot's value until we publish via `sequence`.
                    unsafe {
                        (*slot.value.get()) = MaybeUninit::new(ptr::read(item.as_mut_ptr()));
                    }
                    slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                    if self.config.enable_metrics {
                        self.metrics.add_messages_sent(1);
                    }
                    return true;
                }
            } else if dif < 0 {
                return false;
            } else {
                backoff.spin();
            }
        }
    }

    /// Dequeues the next item in FIFO order, or `None` if empty. Only sound
    /// to call from a single consumer thread at a time.
    pub fn try_dequeue(&self) -> Option<T> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        let dif = seq as isize - (pos.wrapping_add(1)) as isize;

        if dif != 0 {
            return None;
        }

        // SAFETY: dif == 0 means the producer's Release store of
        // `sequence = pos + 1` has happened-before this Acquire load, so the
        // value write is visible; we are the sole consumer so no one else
        // reads this slot concurrently.
        let item = unsafe { ptr::read((*slot.value.get()).as_ptr()) };
        slot.sequence
            .store(pos.wrapping_add(self.capacity()), Ordering::Release);
        self.dequeue_pos.store(pos.wrapping_add(1), Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_received(1);
        }

        Some(item)
    }

    /// Reads the next item without removing it. Consumer-only.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        let dif = seq as isize - (pos.wrapping_add(1)) as isize;
        if dif != 0 {
            return None;
        }
        // SAFETY: see `try_dequeue`; we only read, never invalidate the slot.
        Some(unsafe { (*slot.value.get()).assume_init_ref().clone() })
    }

    /// Resets the queue to empty. **Not thread-safe**: callers must quiesce
    /// all producers and the consumer first.
    pub fn clear(&self) {
        while self.try_dequeue().is_some() {}
    }

    /// Running enumerator from the current consumer position to the current
    /// producer position. Yields `Err(ConcurrentModification)` if the
    /// consumer advances `dequeue_pos` during enumeration (spec.md §9).
    #[must_use]
    pub fn iterate(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        let tail = self.enqueue_pos.load(Ordering::Acquire);
        Iter {
            queue: self,
            head_snapshot: head,
            tail_snapshot: tail,
            pos: head,
            poisoned: false,
        }
    }

    /// Snapshot copy of the current contents, oldest first.
    #[must_use]
    pub fn to_array(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iterate().filter_map(Result::ok).collect()
    }

    /// Copies the current contents into `dest` starting at `index`. Returns
    /// the number of items copied.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for `dest`.
    pub fn copy_to(&self, dest: &mut [T], index: usize) -> usize
    where
        T: Clone,
    {
        assert!(index <= dest.len(), "copy index out of bounds");
        let mut n = 0;
        for item in self.iterate() {
            let Ok(item) = item else { break };
            if index + n >= dest.len() {
                break;
            }
            dest[index + n] = item;
            n += 1;
        }
        n
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.config.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl<T> Drop for Mpsc<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}

/// Running enumerator returned by [`Mpsc::iterate`].
pub struct Iter<'a, T> {
    queue: &'a Mpsc<T>,
    head_snapshot: usize,
    tail_snapshot: usize,
    pos: usize,
    poisoned: bool,
}

impl<'a, T: Clone> Iterator for Iter<'a, T> {
    type Item = Result<T, EnumerationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.pos == self.tail_snapshot {
            return None;
        }

        let current_head = self.queue.dequeue_pos.load(Ordering::Relaxed);
        if current_head != self.head_snapshot {
            self.poisoned = true;
            return Some(Err(EnumerationError::ConcurrentModification));
        }

        let slot = &self.queue.buffer[self.pos & self.queue.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq as isize - (self.pos.wrapping_add(1)) as isize != 0 {
            // Producer hasn't published this slot yet; stop here rather
            // than racing ahead of `enqueue_pos`.
            return None;
        }

        // SAFETY: sequence check above confirms the value is published and
        // not yet reclaimed by the consumer (head has not moved).
        let item = unsafe { (*slot.value.get()).assume_init_ref().clone() };
        self.pos = self.pos.wrapping_add(1);
        Some(Ok(item))
    }
}
