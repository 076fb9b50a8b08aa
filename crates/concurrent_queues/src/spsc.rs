use crate::cache_pad::CacheAligned;
use crate::invariants::{
    debug_assert_bounded_count, debug_assert_head_not_past_tail, debug_assert_initialized_read,
    debug_assert_monotonic, debug_assert_no_wrap,
};
use crate::{Backoff, Config, EnumerationError, Metrics, MetricsSnapshot, Reservation};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY (spec.md §4.1, §5)
// =============================================================================
//
// Single-producer single-consumer ring buffer. Exactly one writer touches
// `tail`, exactly one touches `head`, so no CAS is needed anywhere.
//
// ## Sequence Numbers (ABA Prevention)
//
// `head`/`tail` are unbounded u64 counters rather than wrapped indices or a
// capacity+1 sentinel slot. This sidesteps the full/empty ambiguity that the
// sentinel trick exists to resolve, and makes wrap-around practically
// impossible (at 10 billion messages/second, a u64 wraps in ~58 years). The
// buffer index is computed as `sequence & mask` only at the point of slot
// access.
//
// ## Memory Ordering Protocol
//
// **Producer (write path):**
// 1. Load `tail` with Relaxed (only producer writes tail)
// 2. Load `cached_head` with no ordering (UnsafeCell, single-writer)
// 3. If cache insufficient: load `head` with Acquire (synchronizes with consumer)
// 4. Write data to buffer slots (no ordering needed - protected by protocol)
// 5. Store `tail` with Release (publishes writes to consumer)
//
// **Consumer (read path):**
// 1. Load `head` with Relaxed (only consumer writes head)
// 2. Load `cached_tail` with no ordering (UnsafeCell, single-writer)
// 3. If cache insufficient: load `tail` with Acquire (synchronizes with producer)
// 4. Read data from buffer slots (no ordering needed - protected by protocol)
// 5. Store `head` with Release (publishes consumption to producer)
//
// =============================================================================

/// Single-producer/single-consumer bounded ring buffer (spec.md §4.1).
///
/// Optimized with 128-byte alignment to prevent false sharing, cached
/// sequence numbers to minimize cross-core traffic, and batch operations to
/// amortize atomic overhead.
#[repr(C)]
pub struct Spsc<T> {
    // === PRODUCER HOT === (128-byte aligned)
    tail: CacheAligned<AtomicU64>,
    /// Producer's cached view of head (avoids cross-core reads).
    cached_head: CacheAligned<UnsafeCell<u64>>,

    // === CONSUMER HOT === (128-byte aligned)
    head: CacheAligned<AtomicU64>,
    /// Consumer's cached view of tail (avoids cross-core reads).
    cached_tail: CacheAligned<UnsafeCell<u64>>,

    // === COLD STATE ===
    closed: AtomicBool,
    metrics: Metrics,
    config: Config,

    /// Fixed-size storage; `Box<[T]>` rather than `Vec<T>` since the buffer
    /// never grows or shrinks after construction.
    buffer: UnsafeCell<Box<[MaybeUninit<T>]>>,
}

unsafe impl<T: Send> Send for Spsc<T> {}
unsafe impl<T: Send> Sync for Spsc<T> {}

impl<T> Spsc<T> {
    /// Creates a new queue with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let capacity = config.capacity();
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, MaybeUninit::uninit);
        let buffer = buffer.into_boxed_slice();

        Self {
            tail: CacheAligned::new(AtomicU64::new(0)),
            cached_head: CacheAligned::new(UnsafeCell::new(0)),
            head: CacheAligned::new(AtomicU64::new(0)),
            cached_tail: CacheAligned::new(UnsafeCell::new(0)),
            closed: AtomicBool::new(false),
            metrics: Metrics::new(),
            config,
            buffer: UnsafeCell::new(buffer),
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
            assert!(queue.push(item), "seed sequence exceeds queue capacity");
        }
        queue
    }

    // ---------------------------------------------------------------------
    // CONSTANTS & STATUS
    // ---------------------------------------------------------------------

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.config.mask()
    }

    /// Best-effort snapshot of the current item count (spec.md's Non-goal:
    /// exact `Count` under concurrent mutation is not promised).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // EXTERNAL INTERFACE (spec.md §6)
    // ---------------------------------------------------------------------

    /// Enqueues a single item. Returns `false` if the ring is full or closed.
    #[inline]
    pub fn try_enqueue(&self, item: T) -> bool {
        self.push(item)
    }

    /// Dequeues a single item, or `None` if the ring is empty.
    #[allow(clippy::cast_possible_truncation)]
    pub fn try_dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail is only written by the consumer (this path).
        let mut cached_tail = unsafe { *self.cached_tail.get() };
        if head == cached_tail {
            cached_tail = self.tail.load(Ordering::Acquire);
            // SAFETY: cached_tail is only written by the consumer (this
            // path); the Acquire load above synchronizes with the
            // producer's Release store.
            unsafe {
                *self.cached_tail.get() = cached_tail;
            }
            if head == cached_tail {
                return None;
            }
        }

        let mask = self.mask();
        let idx = (head as usize) & mask;
        // SAFETY: idx holds an item published by the producer and not yet
        // claimed by the consumer; `assume_init_read` moves it out and the
        // slot is not read again until the producer rewrites it.
        let item = unsafe {
            let buffer = &*self.buffer.get();
            buffer[idx].assume_init_read()
        };

        self.head.store(head.wrapping_add(1), Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_received(1);
            self.metrics.add_batches_received(1);
        }

        Some(item)
    }

    /// Reads the next item without removing it.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.readable().map(|slice| slice[0].clone())
    }

    /// Resets the queue to empty. **Not thread-safe**: per spec.md §4.1,
    /// the caller must quiesce both the producer and the consumer first.
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = tail.wrapping_sub(head) as usize;
        if count > 0 {
            let mask = self.mask();
            // SAFETY: caller has quiesced both ends, so no other thread
            // observes the buffer while we drop the live range.
            unsafe {
                let buffer = &mut *self.buffer.get();
                for i in 0..count {
                    let idx = (head as usize).wrapping_add(i) & mask;
                    ptr::drop_in_place(buffer[idx].as_mut_ptr());
                }
            }
        }
        self.head.store(tail, Ordering::Release);
        unsafe {
            *self.cached_tail.get() = tail;
        }
    }

    /// Snapshot copy of the current contents, oldest first.
    #[must_use]
    pub fn to_array(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.readable().map_or_else(Vec::new, <[T]>::to_vec)
    }

    /// Copies the current contents into `dest` starting at `index`.
    /// Returns the number of items copied.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for `dest`.
    pub fn copy_to(&self, dest: &mut [T], index: usize) -> usize
    where
        T: Clone,
    {
        assert!(index <= dest.len(), "copy index out of bounds");
        let Some(slice) = self.readable() else {
            return 0;
        };
        let n = slice.len().min(dest.len() - index);
        dest[index..index + n].clone_from_slice(&slice[..n]);
        n
    }

    /// Running (non-snapshot) enumerator over the current contents.
    /// Yields `Err(EnumerationError::ConcurrentModification)` and stops if
    /// the consumer advances `head` while enumeration is in progress,
    /// matching spec.md §9's "running enumerator throws on head movement."
    #[must_use]
    pub fn iterate(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        Iter {
            queue: self,
            head_snapshot: head,
            tail_snapshot: tail,
            pos: head,
            poisoned: false,
        }
    }

    // ---------------------------------------------------------------------
    // PRODUCER API (zero-copy, SPEC_FULL.md §2 addition)
    // ---------------------------------------------------------------------

    /// Reserve n slots for zero-copy writing. Returns `None` if full/closed.
    ///
    /// The returned `Reservation` may contain fewer than `n` items if the
    /// reservation wraps the ring boundary; always check
    /// `reservation.as_mut_slice().len()`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn reserve(&self, n: usize) -> Option<Reservation<'_, T>> {
        if n == 0 || n > self.capacity() {
            return None;
        }

        let tail = self.tail.load(Ordering::Relaxed);

        // SAFETY: cached_head is only written by the producer (this path).
        let cached_head = unsafe { *self.cached_head.get() };
        let space = self
            .capacity()
            .saturating_sub(tail.wrapping_sub(cached_head) as usize);

        if space >= n {
            return Some(self.make_reservation(tail, n));
        }

        // Slow path: refresh cache.
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: cached_head is only written by the producer (this path);
        // the Acquire load above synchronizes with the consumer's Release.
        unsafe {
            *self.cached_head.get() = head;
        }

        let space = self.capacity().saturating_sub(tail.wrapping_sub(head) as usize);
        if space < n {
            return None;
        }

        Some(self.make_reservation(tail, n))
    }

    /// Reserve with adaptive backoff. Spins, yields, then gives up.
    pub fn reserve_with_backoff(&self, n: usize) -> Option<Reservation<'_, T>> {
        let mut backoff = Backoff::new();
        while !backoff.is_completed() {
            if let Some(r) = self.reserve(n) {
                return Some(r);
            }
            if self.is_closed() {
                return None;
            }
            if self.config.enable_metrics {
                self.metrics.add_reserve_spin();
            }
            backoff.snooze();
        }
        None
    }

    fn make_reservation(&self, tail: u64, n: usize) -> Reservation<'_, T> {
        let mask = self.mask();
        let idx = (tail as usize) & mask;
        let contiguous = n.min(self.capacity() - idx);

        // SAFETY: idx is within bounds; these slots are beyond the current
        // tail so the consumer cannot be reading them; only the producer
        // writes slots between tail and tail+n; `Reservation::commit`
        // publishes via a Release store to tail.
        let slice = unsafe {
            let buffer = &mut *self.buffer.get();
            &mut buffer[idx..idx + contiguous]
        };

        let ring_ptr = self as *const Self;
        Reservation::new(slice, ring_ptr)
    }

    pub(crate) fn commit_internal(&self, n: usize) {
        let tail = self.tail.load(Ordering::Relaxed);
        let new_tail = tail.wrapping_add(n as u64);
        let head = self.head.load(Ordering::Relaxed);

        debug_assert_bounded_count!(new_tail.wrapping_sub(head) as usize, self.capacity());
        debug_assert_monotonic!("tail", tail, new_tail);
        debug_assert_no_wrap!("tail", tail, new_tail);

        self.tail.store(new_tail, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_sent(n as u64);
            self.metrics.add_batches_sent(1);
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Returns the currently readable contiguous slice, or `None` if empty.
    #[allow(clippy::cast_possible_truncation)]
    pub fn readable(&self) -> Option<&[T]> {
        let head = self.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail is only written by the consumer (this path).
        let mut cached_tail = unsafe { *self.cached_tail.get() };
        let mut avail = cached_tail.wrapping_sub(head) as usize;

        if avail == 0 {
            cached_tail = self.tail.load(Ordering::Acquire);
            // SAFETY: cached_tail is only written by the consumer (this
            // path); the Acquire load above synchronizes with the
            // producer's Release store.
            unsafe {
                *self.cached_tail.get() = cached_tail;
            }
            avail = cached_tail.wrapping_sub(head) as usize;
            if avail == 0 {
                return None;
            }
        }

        let mask = self.mask();
        let idx = (head as usize) & mask;
        let contiguous = avail.min(self.capacity() - idx);

        // SAFETY: idx is within bounds; items in [head, tail) were written
        // by the producer and published via Release; the Acquire load on
        // tail synchronizes with that Release; only the consumer reads
        // these slots.
        unsafe {
            let buffer = &*self.buffer.get();
            Some(std::slice::from_raw_parts(
                buffer[idx..].as_ptr().cast::<T>(),
                contiguous,
            ))
        }
    }

    /// Advances head after reading `n` items.
    #[inline]
    pub fn advance(&self, n: usize) {
        let head = self.head.load(Ordering::Relaxed);
        let new_head = head.wrapping_add(n as u64);
        let tail = self.tail.load(Ordering::Relaxed);

        debug_assert_head_not_past_tail!(new_head, tail);
        debug_assert_monotonic!("head", head, new_head);

        self.head.store(new_head, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_received(n as u64);
            self.metrics.add_batches_received(1);
        }
    }

    /// Processes ALL available items with a single head update, handler
    /// receives `&T` (use when `T` is cheap to inspect without ownership).
    #[allow(clippy::cast_possible_truncation)]
    pub fn consume_batch<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&T),
    {
        self.consume_up_to(usize::MAX, &mut handler)
    }

    /// Processes up to `max_items` with a single head update.
    #[allow(clippy::cast_possible_truncation)]
    pub fn consume_up_to<F>(&self, max_items: usize, mut handler: F) -> usize
    where
        F: FnMut(&T),
    {
        if max_items == 0 {
            return 0;
        }

        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let avail = tail.wrapping_sub(head) as usize;
        if avail == 0 {
            return 0;
        }

        let to_consume = avail.min(max_items);
        let mask = self.mask();
        let mut pos = head;
        let mut count = 0;

        while count < to_consume {
            debug_assert_initialized_read!(pos, head, tail);
            let idx = (pos as usize) & mask;
            // SAFETY: idx is within bounds; items in [head, tail) were
            // fully written by the producer and published via Release;
            // `assume_init_read` moves ownership out, and the slot is never
            // read again until the producer rewrites it after head
            // advances past it.
            let item = unsafe {
                let buffer = &*self.buffer.get();
                buffer[idx].assume_init_read()
            };
            handler(&item);
            pos = pos.wrapping_add(1);
            count += 1;
        }

        self.head.store(head.wrapping_add(count as u64), Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_received(count as u64);
            self.metrics.add_batches_received(1);
        }

        count
    }

    /// Closes the queue, preventing further `reserve`/`push` calls from the
    /// backoff-retrying variants (plain `push`/`reserve` are unaffected
    /// except that `reserve_with_backoff` stops retrying).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.config.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }

    /// Send a single item (convenience alias for `try_enqueue`/`reserve(1)`).
    #[inline]
    pub fn push(&self, item: T) -> bool {
        self.reserve(1).is_some_and(|mut r| {
            r.as_mut_slice()[0] = MaybeUninit::new(item);
            r.commit();
            true
        })
    }

    /// Batch send (convenience).
    pub fn send(&self, items: &[T]) -> usize
    where
        T: Copy,
    {
        self.reserve(items.len()).map_or(0, |mut reservation| {
            let slice = reservation.as_mut_slice();
            let n = slice.len();
            for i in 0..n {
                slice[i].write(items[i]);
            }
            reservation.commit();
            n
        })
    }

    /// Batch receive (convenience).
    pub fn recv(&self, out: &mut [T]) -> usize
    where
        T: Copy,
    {
        self.readable().map_or(0, |slice| {
            let n = slice.len().min(out.len());
            out[..n].copy_from_slice(&slice[..n]);
            self.advance(n);
            n
        })
    }
}

impl<T> Drop for Spsc<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = tail.wrapping_sub(head) as usize;

        if count > 0 {
            let mask = self.mask();
            let buffer = self.buffer.get_mut();
            for i in 0..count {
                let idx = (head as usize).wrapping_add(i) & mask;
                unsafe {
                    ptr::drop_in_place(buffer[idx].as_mut_ptr());
                }
            }
        }
    }
}

/// Running enumerator returned by [`Spsc::iterate`].
pub struct Iter<'a, T> {
    queue: &'a Spsc<T>,
    head_snapshot: u64,
    tail_snapshot: u64,
    pos: u64,
    poisoned: bool,
}

impl<'a, T: Clone> Iterator for Iter<'a, T> {
    type Item = Result<T, EnumerationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.pos == self.tail_snapshot {
            return None;
        }

        let current_head = self.queue.head.load(Ordering::Relaxed);
        if current_head != self.head_snapshot {
            self.poisoned = true;
            return Some(Err(EnumerationError::ConcurrentModification));
        }

        let idx = (self.pos as usize) & self.queue.mask();
        // SAFETY: `pos` is within [head_snapshot, tail_snapshot), and we
        // just confirmed head has not advanced past it, so this slot is
        // still initialized and the consumer has not reused it.
        let item = unsafe { (*self.queue.buffer.get())[idx].assume_init_ref().clone() };
        self.pos = self.pos.wrapping_add(1);
        Some(Ok(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spsc_reserve_commit_roundtrip() {
        let queue = Spsc::<u64>::new(Config::default());
        if let Some(mut r) = queue.reserve(4) {
            let slice = r.as_mut_slice();
            slice[0].write(100);
            slice[1].write(200);
            slice[2].write(300);
            slice[3].write(400);
            r.commit();
        }
        assert_eq!(queue.len(), 4);

        if let Some(slice) = queue.readable() {
            assert_eq!(slice[0], 100);
            assert_eq!(slice[3], 400);
            queue.advance(4);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spsc_try_enqueue_dequeue() {
        let queue = Spsc::<u64>::new(Config::new(16, false));
        for i in 0..10 {
            assert!(queue.try_enqueue(i));
        }
        for i in 0..10 {
            assert_eq!(queue.try_dequeue(), Some(i));
        }
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn test_spsc_capacity_full() {
        let config = Config::new(16, false);
        let queue = Spsc::<u64>::new(config);
        for i in 0..16 {
            assert!(queue.try_enqueue(i));
        }
        assert!(!queue.try_enqueue(99));
    }

    #[test]
    fn test_spsc_to_array_and_copy_to() {
        let queue = Spsc::<u64>::new(Config::new(16, false));
        for i in 0..5 {
            queue.try_enqueue(i);
        }
        assert_eq!(queue.to_array(), vec![0, 1, 2, 3, 4]);

        let mut dest = vec![0u64; 7];
        let n = queue.copy_to(&mut dest, 1);
        assert_eq!(n, 5);
        assert_eq!(dest, vec![0, 0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn test_spsc_clear_quiesced() {
        let queue = Spsc::<u64>::new(Config::new(16, false));
        for i in 0..5 {
            queue.try_enqueue(i);
        }
        queue.clear();
        assert!(queue.is_empty());
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spsc_running_iterator_sees_live_data() {
        let queue = Spsc::<u64>::new(Config::new(16, false));
        for i in 0..5 {
            queue.try_enqueue(i);
        }
        let collected: Vec<u64> = queue
            .iterate()
            .map(|r| r.expect("no concurrent modification"))
            .collect();
        assert_eq!(collected, vec![0, 1, 2, 3, 4]);
        // Enumeration is non-destructive.
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_spsc_running_iterator_detects_concurrent_dequeue() {
        let queue = Spsc::<u64>::new(Config::new(16, false));
        for i in 0..5 {
            queue.try_enqueue(i);
        }
        let mut iter = queue.iterate();
        assert_eq!(iter.next(), Some(Ok(0)));
        queue.try_dequeue(); // moves head underneath the live enumerator
        assert_eq!(iter.next(), Some(Err(EnumerationError::ConcurrentModification)));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_spsc_new_from_seed() {
        let queue = Spsc::<u64>::new_from(8, [1, 2, 3]);
        assert_eq!(queue.to_array(), vec![1, 2, 3]);
    }

    #[test]
    fn test_consume_batch_drops_items() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropTracker {
            _id: u64,
        }

        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, O::SeqCst);
            }
        }

        DROP_COUNT.store(0, O::SeqCst);
        let queue = Spsc::<DropTracker>::new(Config::default());

        for i in 0..5 {
            queue.try_enqueue(DropTracker { _id: i });
        }
        assert_eq!(DROP_COUNT.load(O::SeqCst), 0);

        let consumed = queue.consume_batch(|_| {});
        assert_eq!(consumed, 5);
        assert_eq!(DROP_COUNT.load(O::SeqCst), 5);
    }
}
