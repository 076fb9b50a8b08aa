use crate::cache_pad::CacheAligned;
use crate::{Backoff, Config, EnumerationError, Metrics, MetricsSnapshot};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// Multi-producer / multi-consumer bounded ring (spec.md §4.3)
// =============================================================================
//
// Same Vyukov slot protocol as `Mpsc` (spec.md §4.2), but both `enqueue_pos`
// ("Tail") and `dequeue_pos` ("Head") are claimed via CAS, since more than
// one consumer may now race for the same slot.
//
//   enqueue: dif = slot.sequence - pos
//     dif == 0  -> CAS enqueue_pos, write, store slot.sequence = pos + 1
//     dif  < 0  -> full
//     dif  > 0  -> lost race, retry
//
//   dequeue: dif = slot.sequence - (pos + 1)
//     dif == 0  -> CAS dequeue_pos, read, store slot.sequence = pos + capacity
//     dif  < 0  -> check Tail - Head <= 0 (empty) against a fresh Tail read,
//                  else lost race to a producer that hasn't published yet
//     dif  > 0  -> lost race to another consumer, retry

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer/multi-consumer queue (spec.md §4.3).
pub struct Mpmc<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CacheAligned<AtomicUsize>,
    dequeue_pos: CacheAligned<AtomicUsize>,
    metrics: Metrics,
    config: Config,
}

unsafe impl<T: Send> Send for Mpmc<T> {}
unsafe impl<T: Send> Sync for Mpmc<T> {}

impl<T> Mpmc<T> {
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

    /// Creates a queue with capacity `capacity.next_power_of_two()` seeded
    /// with `items` in order (spec.md §6's `new(collection)`).
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

    /// Best-effort snapshot of the current item count (spec.md's Non-goal:
    /// exact `Count` under concurrent mutation is not promised).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Claims a slot and writes `item`. Returns `false` if the queue is
    /// full. Any number of producer threads may call this concurrently.
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
                backoff.spin();
            } else if dif < 0 {
                return false;
            } else {
                backoff.spin();
            }
        }
    }

    /// Dequeues the next item in counter order, or `None` if the queue is
    /// empty. Any number of consumer threads may call this concurrently;
    /// each item is delivered to exactly one caller.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut backoff = Backoff::new();

        loop {
            let pos = self.dequeue_pos.load(Ordering::Relaxed);
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - (pos.wrapping_add(1)) as isize;

            if dif == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // SAFETY: winning the CAS makes us the sole reader of
                    // this slot; the Acquire load of `sequence` above
                    // synchronizes with the producer's Release store that
                    // published the value.
                    let item = unsafe { ptr::read((*slot.value.get()).as_ptr()) };
                    slot.sequence
                        .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                    if self.config.enable_metrics {
                        self.metrics.add_messages_received(1);
                    }
                    return Some(item);
                }
                backoff.spin();
            } else if dif < 0 {
                // Either genuinely empty, or a producer has claimed `pos`
                // but has not yet published it. Re-read Tail to tell them
                // apart, per spec.md §4.3's `IsEmpty` rule.
                let tail = self.enqueue_pos.load(Ordering::Acquire);
                if tail.wrapping_sub(pos) as isize <= 0 {
                    return None;
                }
                backoff.spin();
            } else {
                backoff.spin();
            }
        }
    }

    /// Reads the next item without removing it. Non-destructive; may race
    /// with a concurrent `try_dequeue` stealing the same slot, in which
    /// case this simply returns `None`.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq as isize - (pos.wrapping_add(1)) as isize != 0 {
            return None;
        }
        // SAFETY: sequence check confirms the producer's publish has
        // happened-before this read; a concurrent dequeue of this exact
        // slot cannot yet have overwritten it (it would first have to
        // advance `dequeue_pos` past `pos`, which requires the CAS this
        // read does not perform).
        Some(unsafe { (*slot.value.get()).assume_init_ref().clone() })
    }

    /// Probes whether the queue currently holds no items. Double-checks a
    /// fresh `Tail` read to rule out a transient false-empty observation
    /// (spec.md §4.3).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        loop {
            let pos = self.dequeue_pos.load(Ordering::Relaxed);
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - (pos.wrapping_add(1)) as isize;
            if dif == 0 {
                return false;
            }
            let tail = self.enqueue_pos.load(Ordering::Acquire);
            if tail.wrapping_sub(pos) as isize <= 0 {
                return true;
            }
            // A producer has claimed but not yet published `pos`; spin and
            // re-check rather than reporting a stale empty/non-empty split.
            std::hint::spin_loop();
        }
    }

    /// Drains the queue by repeated `try_dequeue`. Safe to call while other
    /// operations are in flight, but per spec.md §4.3 it may also drain
    /// items enqueued concurrently with the clear, so it can run
    /// arbitrarily long under sustained load.
    pub fn clear(&self) {
        while self.try_dequeue().is_some() {}
    }

    /// Running enumerator over the current contents, oldest first. Yields
    /// `Err(EnumerationError::ConcurrentModification)` and stops if the
    /// consumer position advances during enumeration (spec.md §9).
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

impl<T> Drop for Mpmc<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}

/// Running enumerator returned by [`Mpmc::iterate`].
pub struct Iter<'a, T> {
    queue: &'a Mpmc<T>,
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
            return None;
        }

        // SAFETY: sequence check confirms the value is published and the
        // head-movement check above confirms no consumer has reclaimed it.
        let item = unsafe { (*slot.value.get()).assume_init_ref().clone() };
        self.pos = self.pos.wrapping_add(1);
        Some(Ok(item))
    }
}
