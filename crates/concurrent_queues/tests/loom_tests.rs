//! Loom-based concurrency tests for the ring queue cores.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores all possible thread interleavings to find
//! concurrency bugs that might only occur under specific scheduling.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

/// Simplified ring buffer for loom testing.
/// 
/// We test the core synchronization protocol in isolation, using a smaller
/// capacity to keep the state space manageable for loom's exhaustive search.
struct LoomRing {
    /// Tail index (written by producer)
    tail: AtomicU64,
    /// Head index (written by consumer)  
    head: AtomicU64,
    /// Buffer (simplified to just track writes)
    buffer: UnsafeCell<[u64; 4]>,
    capacity: usize,
}

unsafe impl Send for LoomRing {}
unsafe impl Sync for LoomRing {}

impl LoomRing {
    fn new() -> Self {
        Self {
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            buffer: UnsafeCell::new([0; 4]),
            capacity: 4,
        }
    }

    fn mask(&self) -> usize {
        self.capacity - 1
    }

    /// Producer: try to push a value
    fn push(&self, value: u64) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        
        let space = self.capacity.saturating_sub((tail - head) as usize);
        if space == 0 {
            return false;
        }

        let idx = (tail as usize) & self.mask();
        
        // SAFETY: We verified space > 0, so this slot is available
        unsafe {
            (*self.buffer.get())[idx] = value;
        }
        
        // Release: publishes the write to consumer
        self.tail.store(tail + 1, Ordering::Release);
        true
    }

    /// Consumer: try to pop a value
    fn pop(&self) -> Option<u64> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        
        if head == tail {
            return None;
        }

        let idx = (head as usize) & self.mask();
        
        // SAFETY: We verified tail > head, so this slot has data
        let value = unsafe { (*self.buffer.get())[idx] };
        
        // Release: publishes consumption to producer
        self.head.store(head + 1, Ordering::Release);
        Some(value)
    }
}

/// Test basic SPSC push/pop with loom's exhaustive interleaving exploration.
#[test]
fn loom_spsc_basic() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new());
        let ring2 = Arc::clone(&ring);

        // Producer thread
        let producer = thread::spawn(move || {
            ring2.push(42);
            ring2.push(43);
        });

        // Consumer thread
        let consumer = thread::spawn(move || {
            let mut received = Vec::new();
            // Try multiple times since producer might not have pushed yet
            for _ in 0..10 {
                if let Some(v) = ring.pop() {
                    received.push(v);
                }
                if received.len() == 2 {
                    break;
                }
                loom::thread::yield_now();
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        
        // Verify FIFO order if we received anything
        if received.len() >= 2 {
            assert_eq!(received[0], 42);
            assert_eq!(received[1], 43);
        }
    });
}

/// Test that producer blocks when ring is full.
#[test]
fn loom_spsc_full_ring() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new());
        let ring2 = Arc::clone(&ring);

        // Fill the ring (capacity = 4)
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(ring.push(3));
        assert!(ring.push(4));
        
        // Should fail - ring is full
        assert!(!ring.push(5));

        // Consumer frees one slot
        let consumer = thread::spawn(move || {
            ring2.pop()
        });

        let value = consumer.join().unwrap();
        assert_eq!(value, Some(1));
        
        // Now producer can push
        assert!(ring.push(5));
    });
}

/// Test concurrent producer and consumer with multiple items.
#[test]
fn loom_spsc_concurrent() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new());
        let ring_producer = Arc::clone(&ring);
        let ring_consumer = Arc::clone(&ring);

        let sent = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(AtomicUsize::new(0));
        
        let sent_clone = Arc::clone(&sent);
        let received_clone = Arc::clone(&received);

        // Producer: send 2 items
        let producer = thread::spawn(move || {
            if ring_producer.push(100) {
                sent_clone.fetch_add(1, Ordering::SeqCst);
            }
            if ring_producer.push(200) {
                sent_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Consumer: receive items
        let consumer = thread::spawn(move || {
            for _ in 0..4 {
                if ring_consumer.pop().is_some() {
                    received_clone.fetch_add(1, Ordering::SeqCst);
                }
                loom::thread::yield_now();
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();

        // Received should not exceed sent
        let s = sent.load(Ordering::SeqCst);
        let r = received.load(Ordering::SeqCst);
        assert!(r <= s, "received {} but only sent {}", r, s);
    });
}

/// Test the cached sequence number optimization pattern.
/// This verifies our fast-path/slow-path cache refresh is correct.
#[test]
fn loom_cached_sequence_pattern() {
    loom::model(|| {
        let tail = Arc::new(AtomicU64::new(0));
        let head = Arc::new(AtomicU64::new(0));
        
        // Simulated cached values (would be UnsafeCell in real code)
        let cached_head = Arc::new(AtomicU64::new(0));
        let cached_tail = Arc::new(AtomicU64::new(0));

        let tail_p = Arc::clone(&tail);
        let head_p = Arc::clone(&head);
        let cached_head_p = Arc::clone(&cached_head);

        let tail_c = Arc::clone(&tail);
        let head_c = Arc::clone(&head);
        let cached_tail_c = Arc::clone(&cached_tail);

        // Producer: uses cached_head, refreshes from head when needed
        let producer = thread::spawn(move || {
            let t = tail_p.load(Ordering::Relaxed);
            
            // Fast path: check cache
            let ch = cached_head_p.load(Ordering::Relaxed);
            let space = 4usize.saturating_sub((t.wrapping_sub(ch)) as usize);
            
            if space == 0 {
                // Slow path: refresh cache
                let h = head_p.load(Ordering::Acquire);
                cached_head_p.store(h, Ordering::Relaxed);
            }
            
            // Publish write
            tail_p.store(t + 1, Ordering::Release);
        });

        // Consumer: uses cached_tail, refreshes from tail when needed  
        let consumer = thread::spawn(move || {
            let h = head_c.load(Ordering::Relaxed);
            
            // Fast path: check cache
            let ct = cached_tail_c.load(Ordering::Relaxed);
            let avail = ct.wrapping_sub(h) as usize;
            
            if avail == 0 {
                // Slow path: refresh cache
                let t = tail_c.load(Ordering::Acquire);
                cached_tail_c.store(t, Ordering::Relaxed);
            }
            
            // Publish consumption
            head_c.store(h + 1, Ordering::Release);
        });

        producer.join().unwrap();
        consumer.join().unwrap();
        
        // Both should have advanced by 1
        assert_eq!(tail.load(Ordering::SeqCst), 1);
        assert_eq!(head.load(Ordering::SeqCst), 1);
    });
}

// =============================================================================
// Per-slot sequence-number protocol (Mpsc/Mpmc) under loom
// =============================================================================
//
// `Mpsc`/`Mpmc` themselves are built on `std::sync::atomic`, not loom's
// atomics, so they cannot be driven through loom directly (loom needs to
// own every atomic/`UnsafeCell` access in the model). These toys mirror
// the exact CAS-with-sequence-number protocol from `mpsc.rs`/`mpmc.rs`
// one level down, at a capacity small enough for loom's exhaustive search
// to finish in reasonable time.

struct LoomSeqSlot {
    sequence: AtomicUsize,
    value: UnsafeCell<u64>,
}

/// Mirrors `Mpsc`: producers CAS a shared `enqueue_pos`, the single
/// consumer advances `dequeue_pos` with no CAS.
struct LoomMpscRing {
    buffer: [LoomSeqSlot; 2],
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl Send for LoomMpscRing {}
unsafe impl Sync for LoomMpscRing {}

impl LoomMpscRing {
    fn new() -> Self {
        Self {
            buffer: [
                LoomSeqSlot { sequence: AtomicUsize::new(0), value: UnsafeCell::new(0) },
                LoomSeqSlot { sequence: AtomicUsize::new(1), value: UnsafeCell::new(0) },
            ],
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    fn try_enqueue(&self, item: u64) -> bool {
        loop {
            let pos = self.enqueue_pos.load(Ordering::Relaxed);
            let slot = &self.buffer[pos & 1];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;

            if dif == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    unsafe {
                        *slot.value.get() = item;
                    }
                    slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                    return true;
                }
            } else if dif < 0 {
                return false;
            } else {
                loom::thread::yield_now();
            }
        }
    }

    /// Single-consumer only, like the real `Mpsc::try_dequeue`.
    fn try_dequeue(&self) -> Option<u64> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & 1];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq as isize - (pos.wrapping_add(1)) as isize != 0 {
            return None;
        }
        let value = unsafe { *slot.value.get() };
        slot.sequence.store(pos.wrapping_add(2), Ordering::Release);
        self.dequeue_pos.store(pos.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

/// Two producers race for the same two slots while a single consumer
/// drains concurrently; every value that was actually written must be
/// observed at most once and never torn.
#[test]
fn loom_mpsc_two_producers_single_consumer() {
    loom::model(|| {
        let ring = Arc::new(LoomMpscRing::new());
        let ring_p1 = Arc::clone(&ring);
        let ring_p2 = Arc::clone(&ring);

        let p1 = thread::spawn(move || ring_p1.try_enqueue(10));
        let p2 = thread::spawn(move || ring_p2.try_enqueue(20));

        let consumer = thread::spawn(move || {
            let mut received = Vec::new();
            for _ in 0..2 {
                if let Some(v) = ring.try_dequeue() {
                    received.push(v);
                }
            }
            received
        });

        let ok1 = p1.join().unwrap();
        let ok2 = p2.join().unwrap();
        let received = consumer.join().unwrap();

        let expected_count = usize::from(ok1) + usize::from(ok2);
        assert!(received.len() <= expected_count);
        for v in &received {
            assert!(*v == 10 || *v == 20);
        }
        // No duplicates: each producer's value appears at most once.
        assert!(received.iter().filter(|&&v| v == 10).count() <= 1);
        assert!(received.iter().filter(|&&v| v == 20).count() <= 1);
    });
}

/// Mirrors `Mpmc`: both ends are CAS'd, so two consumers can race for the
/// same dequeued item the way two producers race for the same slot.
struct LoomMpmcRing {
    buffer: [LoomSeqSlot; 2],
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl Send for LoomMpmcRing {}
unsafe impl Sync for LoomMpmcRing {}

impl LoomMpmcRing {
    fn new() -> Self {
        Self {
            buffer: [
                LoomSeqSlot { sequence: AtomicUsize::new(0), value: UnsafeCell::new(0) },
                LoomSeqSlot { sequence: AtomicUsize::new(1), value: UnsafeCell::new(0) },
            ],
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    fn try_enqueue(&self, item: u64) -> bool {
        loop {
            let pos = self.enqueue_pos.load(Ordering::Relaxed);
            let slot = &self.buffer[pos & 1];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;

            if dif == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    unsafe {
                        *slot.value.get() = item;
                    }
                    slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                    return true;
                }
            } else if dif < 0 {
                return false;
            } else {
                loom::thread::yield_now();
            }
        }
    }

    fn try_dequeue(&self) -> Option<u64> {
        loop {
            let pos = self.dequeue_pos.load(Ordering::Relaxed);
            let slot = &self.buffer[pos & 1];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - (pos.wrapping_add(1)) as isize;

            if dif == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let value = unsafe { *slot.value.get() };
                    slot.sequence.store(pos.wrapping_add(2), Ordering::Release);
                    return Some(value);
                }
            } else if dif < 0 {
                return None;
            } else {
                loom::thread::yield_now();
            }
        }
    }
}

/// Two producers and two consumers contend on a two-slot ring: the total
/// number of items dequeued must never exceed the total number actually
/// enqueued, and no two consumers observe the same slot generation.
#[test]
fn loom_mpmc_two_producers_two_consumers() {
    loom::model(|| {
        let ring = Arc::new(LoomMpmcRing::new());
        let ring_p1 = Arc::clone(&ring);
        let ring_p2 = Arc::clone(&ring);
        let ring_c1 = Arc::clone(&ring);
        let ring_c2 = Arc::clone(&ring);

        let p1 = thread::spawn(move || ring_p1.try_enqueue(1));
        let p2 = thread::spawn(move || ring_p2.try_enqueue(2));
        let c1 = thread::spawn(move || ring_c1.try_dequeue());
        let c2 = thread::spawn(move || ring_c2.try_dequeue());

        let ok1 = p1.join().unwrap();
        let ok2 = p2.join().unwrap();
        let r1 = c1.join().unwrap();
        let r2 = c2.join().unwrap();

        let sent = usize::from(ok1) + usize::from(ok2);
        let got: Vec<u64> = [r1, r2].into_iter().flatten().collect();
        assert!(got.len() <= sent);
        // The two consumers can never both have won the same slot's CAS.
        if let (Some(a), Some(b)) = (r1, r2) {
            assert_ne!(a, b, "both consumers observed the same value");
        }
    });
}

// =============================================================================
// Segment freeze/grow transition (Segmented) under loom
// =============================================================================
//
// Mirrors `Segment::try_enqueue`'s `dif < 0` freeze branch and
// `SegmentedQueue::enqueue_inner`'s segment-link-under-lock retry: a
// one-segment-deep chain with a fixed capacity of 2, so a single producer
// overflowing it must freeze, link a successor, and have the in-flight
// item land in the new segment instead of being dropped.

struct LoomSegment {
    buffer: [LoomSeqSlot; 2],
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
    frozen: loom::sync::atomic::AtomicBool,
    next: loom::sync::Mutex<Option<Arc<LoomSegment>>>,
}

unsafe impl Send for LoomSegment {}
unsafe impl Sync for LoomSegment {}

impl LoomSegment {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            buffer: [
                LoomSeqSlot { sequence: AtomicUsize::new(0), value: UnsafeCell::new(0) },
                LoomSeqSlot { sequence: AtomicUsize::new(1), value: UnsafeCell::new(0) },
            ],
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
            frozen: loom::sync::atomic::AtomicBool::new(false),
            next: loom::sync::Mutex::new(None),
        })
    }

    /// `Ok` on success, `Err(item)` if full/frozen — caller freezes and
    /// links a successor, exactly as `Segment::try_enqueue`'s `dif < 0`
    /// branch hands the item back to `SegmentedQueue::enqueue_inner`.
    fn try_enqueue(&self, item: u64) -> Result<(), u64> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(item);
        }
        let pos = self.enqueue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & 1];
        let seq = slot.sequence.load(Ordering::Acquire);
        let dif = seq as isize - pos as isize;

        if dif == 0 {
            if self
                .enqueue_pos
                .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe {
                    *slot.value.get() = item;
                }
                slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                return Ok(());
            }
        }
        Err(item)
    }

    fn try_dequeue(&self) -> Option<u64> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & 1];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq as isize - (pos.wrapping_add(1)) as isize != 0 {
            return None;
        }
        let value = unsafe { *slot.value.get() };
        slot.sequence.store(pos.wrapping_add(2), Ordering::Release);
        self.dequeue_pos.store(pos.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

fn loom_segmented_push(tail: &loom::sync::Mutex<Arc<LoomSegment>>, item: u64) {
    let mut item = item;
    loop {
        let current_tail = tail.lock().unwrap().clone();
        match current_tail.try_enqueue(item) {
            Ok(()) => return,
            Err(returned) => {
                item = returned;
                let mut tail_guard = tail.lock().unwrap();
                if Arc::ptr_eq(&*tail_guard, &current_tail) {
                    current_tail.frozen.store(true, Ordering::Release);
                    let mut next_guard = current_tail.next.lock().unwrap();
                    if next_guard.is_none() {
                        *next_guard = Some(LoomSegment::new());
                    }
                    let new_segment = next_guard.clone().unwrap();
                    drop(next_guard);
                    *tail_guard = new_segment;
                }
            }
        }
    }
}

/// A single producer overflows a capacity-2 segment while a consumer
/// drains concurrently: every item must still arrive, in order, by
/// following the frozen segment's `next` link rather than being dropped
/// at the freeze boundary.
#[test]
fn loom_segment_freeze_and_grow_preserves_items() {
    loom::model(|| {
        let first = LoomSegment::new();
        let tail = Arc::new(loom::sync::Mutex::new(Arc::clone(&first)));
        let head = Arc::clone(&first);

        let tail_p = Arc::clone(&tail);
        let producer = thread::spawn(move || {
            loom_segmented_push(&tail_p, 1);
            loom_segmented_push(&tail_p, 2);
            loom_segmented_push(&tail_p, 3);
        });

        let consumer = thread::spawn(move || {
            let mut received = Vec::new();
            let mut segment = head;
            while received.len() < 3 {
                match segment.try_dequeue() {
                    Some(v) => received.push(v),
                    None => {
                        let next = segment.next.lock().unwrap().clone();
                        match next {
                            Some(n) => segment = n,
                            None => loom::thread::yield_now(),
                        }
                    }
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    });
}
