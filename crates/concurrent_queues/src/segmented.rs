use crate::backoff::Backoff;
use crate::cache_pad::CacheAligned;
use crate::config::SegmentedConfig;
use crate::error::SegmentedQueueError;
use crate::invariants::debug_assert_freeze_offset;
use crate::metrics::{Metrics, MetricsSnapshot, ResizeMetrics};
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// Unbounded (or capped) segmented multi-producer/multi-consumer queue
// (spec.md §4.4)
// =============================================================================
//
// The fast path on each segment is the `Mpmc` sequence-number protocol
// (spec.md §4.3), CAS on both `enqueue_pos`/`dequeue_pos`. What this module
// adds on top is the segment state machine: a segment that fills up is
// *frozen* (no more producers accepted; consumers keep draining it), a
// successor segment is allocated and linked, and the queue's `head`/`tail`
// pointers advance across segment boundaries under a short cross-segment
// lock that never guards the hot per-slot path.
//
// Segment links (`next`) and the queue's own `head`/`tail` are
// `arc-swap`-backed so that readers (`peek`, `count`, a live `dequeue` that
// has fallen behind `head`) can walk the chain without ever taking the
// cross-segment lock; the lock is only needed to *mutate* those pointers,
// and mutation is already serialized because only the thread that observed
// a segment as full performs the corresponding freeze/link/advance.

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Outcome of a single-segment dequeue attempt.
enum SegDequeue<T> {
    Item(T),
    /// No item ready, and the segment is not frozen: genuinely empty right
    /// now, but a producer could still land here later.
    EmptyActive,
    /// No item ready and the segment is frozen: it will never receive
    /// another item. The caller should advance to `next`.
    EmptyFrozen,
}

struct Segment<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    capacity: usize,
    enqueue_pos: CacheAligned<AtomicUsize>,
    dequeue_pos: CacheAligned<AtomicUsize>,
    /// Producers stop accepting once set; existing in-flight enqueues may
    /// still complete (spec.md's "Freeze" in the GLOSSARY).
    frozen: AtomicBool,
    /// Set while a snapshot enumeration is in progress over this segment;
    /// dequeue must not clear the slot payload while this holds (spec.md's
    /// "Preserve").
    preserved: AtomicBool,
    next: ArcSwapOption<Segment<T>>,
}

unsafe impl<T: Send> Send for Segment<T> {}
unsafe impl<T: Send> Sync for Segment<T> {}

impl<T> Segment<T> {
    fn new(len: usize) -> Self {
        let buffer = (0..len)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: len - 1,
            capacity: len,
            enqueue_pos: CacheAligned::new(AtomicUsize::new(0)),
            dequeue_pos: CacheAligned::new(AtomicUsize::new(0)),
            frozen: AtomicBool::new(false),
            preserved: AtomicBool::new(false),
            next: ArcSwapOption::const_empty(),
        }
    }

    #[inline]
    fn is_preserved(&self) -> bool {
        self.preserved.load(Ordering::Acquire)
    }

    /// `Tail - Head`, which for a frozen segment is implicitly clamped
    /// because no further enqueue can move `Tail` past the point of
    /// freezing (spec.md §4.4's `FreezeOffset`).
    fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Acquire);
        let head = self.dequeue_pos.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity)
    }

    /// Returns the item back to the caller on `Err` so a full (or frozen)
    /// segment never silently drops it: the caller retries against
    /// whatever segment becomes the new tail.
    fn try_enqueue(&self, item: T) -> Result<(), T> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(item);
        }

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
                    // this slot until we publish via `sequence`.
                    unsafe {
                        (*slot.value.get()) = MaybeUninit::new(ptr::read(item.as_mut_ptr()));
                    }
                    slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
                backoff.spin();
            } else if dif < 0 {
                debug_assert_freeze_offset!(dif as i64, self.capacity as i64);
                // SAFETY: the CAS above never ran, so `item` was never
                // read out of this `MaybeUninit`.
                return Err(unsafe { item.assume_init() });
            } else {
                backoff.spin();
            }
        }
    }

    fn try_dequeue(&self) -> SegDequeue<T> {
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
                    // this slot; the Acquire load above synchronizes with
                    // the producer's Release publish. Reading out the
                    // value bitwise does not zero the slot: a concurrent
                    // snapshot over a `preserved` segment (see
                    // `SegmentedQueue::to_array`) may still safely `clone`
                    // the same bytes afterwards, since overwriting a slot
                    // on the next lap assigns a fresh `MaybeUninit<T>`
                    // without ever running `T`'s destructor on the old one.
                    let item = unsafe { ptr::read((*slot.value.get()).as_ptr()) };
                    slot.sequence
                        .store(pos.wrapping_add(self.capacity), Ordering::Release);
                    return SegDequeue::Item(item);
                }
                backoff.spin();
            } else if dif < 0 {
                let tail = self.enqueue_pos.load(Ordering::Acquire);
                if tail.wrapping_sub(pos) as isize <= 0 {
                    return if self.frozen.load(Ordering::Acquire) {
                        SegDequeue::EmptyFrozen
                    } else {
                        SegDequeue::EmptyActive
                    };
                }
                backoff.spin();
            } else {
                backoff.spin();
            }
        }
    }

    fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq as isize - (pos.wrapping_add(1)) as isize != 0 {
            return None;
        }
        // SAFETY: sequence check confirms the value is published; a
        // concurrent dequeue would need the CAS this read does not take.
        Some(unsafe { (*slot.value.get()).assume_init_ref().clone() })
    }
}

/// Multi-producer/multi-consumer queue built from linked ring segments,
/// unbounded by default (spec.md §4.4). Construct with
/// [`SegmentedConfig::fixed_size`] set to cap it at its first segment.
pub struct SegmentedQueue<T> {
    head: ArcSwap<Segment<T>>,
    tail: ArcSwap<Segment<T>>,
    /// Guards segment-transition bookkeeping only: freezing the old tail
    /// and linking/publishing the new one, advancing `head` past a
    /// drained+frozen segment, and snapshot preparation. Never held across
    /// a per-slot enqueue/dequeue.
    cross_segment: Mutex<()>,
    config: SegmentedConfig,
    metrics: Metrics,
    resize_metrics: ResizeMetrics,
}

unsafe impl<T: Send> Send for SegmentedQueue<T> {}
unsafe impl<T: Send> Sync for SegmentedQueue<T> {}

impl<T> SegmentedQueue<T> {
    #[must_use]
    pub fn new(config: SegmentedConfig) -> Self {
        let first = Arc::new(Segment::new(config.initial_length()));
        let resize_metrics = ResizeMetrics::new();
        resize_metrics.segment_linked();
        Self {
            head: ArcSwap::new(Arc::clone(&first)),
            tail: ArcSwap::new(first),
            cross_segment: Mutex::new(()),
            config,
            metrics: Metrics::new(),
            resize_metrics,
        }
    }

    /// Seeded construction (spec.md §6's `new(collection)`).
    #[must_use]
    pub fn new_from(config: SegmentedConfig, items: impl IntoIterator<Item = T>) -> Self {
        let queue = Self::new(config);
        for item in items {
            let _ = queue.enqueue(item);
        }
        queue
    }

    #[must_use]
    pub fn is_fixed_size(&self) -> bool {
        self.config.fixed_size
    }

    /// Unchecked enqueue: returns `false` instead of growing when the queue
    /// is fixed-size and full (spec.md §6).
    pub fn try_enqueue(&self, item: T) -> bool {
        self.enqueue_inner(item).is_ok()
    }

    /// Checked enqueue: raises [`SegmentedQueueError::Full`] when the queue
    /// is fixed-size and full instead of silently growing (spec.md §6's
    /// `enqueue`/`ContractViolation`, §7).
    pub fn enqueue(&self, item: T) -> Result<(), SegmentedQueueError> {
        self.enqueue_inner(item).map_err(|_| SegmentedQueueError::Full)
    }

    fn enqueue_inner(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            let tail = self.tail.load_full();
            match tail.try_enqueue(item) {
                Ok(()) => {
                    if self.config.enable_metrics {
                        self.metrics.add_messages_sent(1);
                    }
                    return Ok(());
                }
                Err(returned) => {
                    item = returned;
                    let _guard = self.cross_segment.lock();
                    // Re-check under the lock: another thread may have
                    // already grown past this tail.
                    let current_tail = self.tail.load_full();
                    if Arc::ptr_eq(&current_tail, &tail) {
                        if self.config.fixed_size {
                            drop(_guard);
                            return Err(item);
                        }
                        let pos = tail.enqueue_pos.load(Ordering::Acquire);
                        let slot = &tail.buffer[pos & tail.mask];
                        let seq = slot.sequence.load(Ordering::Acquire);
                        debug_assert_freeze_offset!(
                            seq as i64 - pos as i64,
                            tail.capacity as i64
                        );
                        tail.frozen.store(true, Ordering::Release);
                        let new_len = if tail.is_preserved() {
                            self.config.initial_length()
                        } else {
                            (tail.capacity * 2).min(crate::config::MAX_SEGMENT_LENGTH)
                        };
                        let new_segment = Arc::new(Segment::new(new_len));
                        tail.next.store(Some(Arc::clone(&new_segment)));
                        self.tail.store(new_segment);
                        self.resize_metrics.add_resize();
                        self.resize_metrics.segment_linked();
                    }
                    // Loop back and retry against whatever `tail` now is.
                }
            }
        }
    }

    /// Dequeues the oldest item in FIFO order per-producer, or `None` if
    /// the queue is empty (spec.md §4.4).
    pub fn try_dequeue(&self) -> Option<T> {
        loop {
            let head = self.head.load_full();
            match head.try_dequeue() {
                SegDequeue::Item(item) => {
                    if self.config.enable_metrics {
                        self.metrics.add_messages_received(1);
                    }
                    return Some(item);
                }
                SegDequeue::EmptyActive => return None,
                SegDequeue::EmptyFrozen => {
                    let Some(next) = head.next.load_full() else {
                        return None;
                    };
                    let _guard = self.cross_segment.lock();
                    let current_head = self.head.load_full();
                    if Arc::ptr_eq(&current_head, &head) {
                        self.head.store(next);
                        self.resize_metrics.segment_retired();
                    }
                    // Loop back and retry against the new head.
                }
            }
        }
    }

    /// Walks `head -> next -> ...` for the first non-empty segment,
    /// without removing anything (spec.md §4.4).
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut segment = self.head.load_full();
        loop {
            if let Some(item) = segment.try_peek() {
                return Some(item);
            }
            match segment.next.load_full() {
                Some(next) => segment = next,
                None => return None,
            }
        }
    }

    /// Best-effort total item count (spec.md's Non-goal: not an exact
    /// snapshot under concurrent mutation). Lock-free when the queue is a
    /// single segment or two adjacent segments; falls back to the
    /// cross-segment lock for three or more (spec.md §4.4).
    #[must_use]
    pub fn count(&self) -> u64 {
        let head = self.head.load_full();
        let tail = self.tail.load_full();

        if Arc::ptr_eq(&head, &tail) {
            return head.len() as u64;
        }
        if let Some(head_next) = head.next.load_full() {
            if Arc::ptr_eq(&head_next, &tail) {
                return head.len() as u64 + tail.len() as u64;
            }
        }

        let _guard = self.cross_segment.lock();
        let mut total: u64 = 0;
        let mut current = self.head.load_full();
        loop {
            total += current.len() as u64;
            match current.next.load_full() {
                Some(next) => current = next,
                None => break,
            }
        }
        total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.try_peek_non_clone_empty_check()
    }

    fn try_peek_non_clone_empty_check(&self) -> bool {
        // Equivalent to `try_peek().is_none()` but does not require
        // `T: Clone`: walk for a segment with a committed-but-undrained
        // slot instead of reading its value.
        let mut segment = self.head.load_full();
        loop {
            let head_pos = segment.dequeue_pos.load(Ordering::Relaxed);
            let slot = &segment.buffer[head_pos & segment.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            if seq as isize - (head_pos.wrapping_add(1)) as isize == 0 {
                return false;
            }
            match segment.next.load_full() {
                Some(next) => segment = next,
                None => return true,
            }
        }
    }

    /// Number of segments currently linked from `head` to the end of the
    /// chain. Diagnostic only; takes the cross-segment lock. See
    /// [`Self::resize_metrics`]'s `segments_live()` for a lock-free,
    /// best-effort gauge of the same quantity.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        let _guard = self.cross_segment.lock();
        let mut n = 1;
        let mut current = self.head.load_full();
        while let Some(next) = current.next.load_full() {
            n += 1;
            current = next;
        }
        n
    }

    /// Freezes the tail and allocates a fresh, empty `head == tail`
    /// segment under the cross-segment lock. In-flight producers that had
    /// already reserved a slot in the old tail complete into it; the old
    /// chain becomes unreachable garbage once those producers and any
    /// lagging consumers finish with it (spec.md §4.4).
    pub fn clear(&self) {
        let _guard = self.cross_segment.lock();
        let old_tail = self.tail.load_full();
        old_tail.frozen.store(true, Ordering::Release);
        let new_len = if self.config.fixed_size {
            old_tail.capacity
        } else {
            self.config.initial_length()
        };
        let fresh = Arc::new(Segment::new(new_len));
        self.head.store(Arc::clone(&fresh));
        self.tail.store(fresh);
        self.resize_metrics.reset_segments_live(1);
    }

    /// Under the cross-segment lock: mark every live segment as preserved
    /// (dequeue stops clearing slot payloads) and freeze the tail, then
    /// record the head/tail positions at that instant (spec.md §4.4's
    /// "Snapshot").
    fn prepare_snapshot(&self) -> (Arc<Segment<T>>, usize, Arc<Segment<T>>, usize) {
        let _guard = self.cross_segment.lock();
        let tail = self.tail.load_full();
        tail.frozen.store(true, Ordering::Release);

        let mut current = self.head.load_full();
        loop {
            current.preserved.store(true, Ordering::Release);
            if Arc::ptr_eq(&current, &tail) {
                break;
            }
            current = current
                .next
                .load_full()
                .expect("segment chain must reach the recorded tail");
        }

        let head = self.head.load_full();
        let head_pos = head.dequeue_pos.load(Ordering::Acquire);
        let tail_pos = tail.enqueue_pos.load(Ordering::Acquire);
        (head, head_pos, tail, tail_pos)
    }

    /// Snapshot copy of the current contents, oldest first. Producers that
    /// had already incremented a segment's tail are waited on to finish
    /// publishing before their slot is read (spec.md §4.4).
    #[must_use]
    pub fn to_array(&self) -> Vec<T>
    where
        T: Clone,
    {
        let (mut segment, mut pos, tail, tail_pos) = self.prepare_snapshot();
        let mut out = Vec::new();

        loop {
            let local_tail = if Arc::ptr_eq(&segment, &tail) {
                tail_pos
            } else {
                segment.enqueue_pos.load(Ordering::Acquire)
            };

            while (pos as isize) < (local_tail as isize) {
                let idx = pos & segment.mask;
                let slot = &segment.buffer[idx];
                let mut backoff = Backoff::new();
                while slot.sequence.load(Ordering::Acquire) != pos.wrapping_add(1) {
                    backoff.snooze();
                }
                // SAFETY: this segment was marked `preserved` before any
                // concurrent dequeue could have cleared the slot, so the
                // payload remains valid to clone even if `dequeue_pos` has
                // since moved past `pos`.
                let value = unsafe { (*slot.value.get()).assume_init_ref().clone() };
                out.push(value);
                pos = pos.wrapping_add(1);
            }

            if Arc::ptr_eq(&segment, &tail) {
                break;
            }
            segment = segment
                .next
                .load_full()
                .expect("segment chain must reach the recorded tail");
            pos = 0;
        }

        out
    }

    /// Copies the snapshot into `dest` starting at `index`. Returns the
    /// number of items copied.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for `dest`.
    pub fn copy_to(&self, dest: &mut [T], index: usize) -> usize
    where
        T: Clone,
    {
        assert!(index <= dest.len(), "copy index out of bounds");
        let snapshot = self.to_array();
        let n = snapshot.len().min(dest.len() - index);
        dest[index..index + n].clone_from_slice(&snapshot[..n]);
        n
    }

    /// Snapshot enumerator (spec.md §9: Segmented exposes a snapshot
    /// enumerator, unlike the running enumerators of the bounded rings).
    #[must_use]
    pub fn iterate(&self) -> std::vec::IntoIter<T>
    where
        T: Clone,
    {
        self.to_array().into_iter()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.config.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }

    #[must_use]
    pub fn resize_metrics(&self) -> &ResizeMetrics {
        &self.resize_metrics
    }
}

impl<T> Drop for SegmentedQueue<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}
