//! Property-based tests for the invariants in spec.md §8: bounded count,
//! monotonic progress, happens-before, and partial reservation.
//!
//! Coverage: `Spsc`, `Mpmc`, `SegmentedQueue`.

use concurrent_queues::{Config, Mpmc, SegmentedConfig, SegmentedQueue, Spsc};
use proptest::prelude::*;
use std::mem::MaybeUninit;

// =============================================================================
// INV-SEQ-01: Bounded Count
// "0 <= (tail - head) <= capacity"
// =============================================================================

proptest! {
    /// `Spsc` never exceeds its capacity after any sequence of operations.
    #[test]
    fn prop_bounded_count_spsc(
        writes in 0usize..200,
    ) {
        let ring = Spsc::<u64>::new(Config::default());
        let capacity = ring.capacity();

        let actual_writes = writes.min(capacity);
        for i in 0..actual_writes {
            if let Some(mut r) = ring.reserve(1) {
                r.as_mut_slice()[0] = MaybeUninit::new(i as u64);
                r.commit();
            }
        }

        prop_assert!(ring.len() <= capacity,
            "len {} > capacity {}", ring.len(), capacity);

        let mut read_count = 0;
        ring.consume_batch(|_| read_count += 1);

        prop_assert!(ring.len() <= capacity);
        prop_assert!(read_count <= actual_writes);
    }

    /// `Mpmc` never exceeds its capacity, and rejects enqueues once full.
    #[test]
    fn prop_bounded_count_mpmc(
        writes in 0usize..200,
    ) {
        let queue = Mpmc::<u64>::new(Config::default());
        let capacity = queue.capacity();

        let mut accepted = 0;
        for i in 0..writes {
            if queue.try_enqueue(i as u64) {
                accepted += 1;
            }
        }

        prop_assert!(accepted <= capacity);
        prop_assert!(queue.len() <= capacity);

        let mut drained = 0;
        while queue.try_dequeue().is_some() {
            drained += 1;
        }
        prop_assert_eq!(drained, accepted);
    }

    /// A `SegmentedQueue` never loses or duplicates items across segment
    /// growth: everything enqueued is exactly what gets dequeued.
    #[test]
    fn prop_bounded_count_segmented(
        writes in 0usize..500,
    ) {
        let queue = SegmentedQueue::<u64>::new(SegmentedConfig::new(4, false));

        for i in 0..writes {
            prop_assert!(queue.try_enqueue(i as u64));
        }
        prop_assert_eq!(queue.count(), writes as u64);

        let mut drained = Vec::new();
        while let Some(item) = queue.try_dequeue() {
            drained.push(item);
        }
        prop_assert_eq!(drained, (0..writes as u64).collect::<Vec<_>>());
    }
}

// =============================================================================
// INV-SEQ-02: Monotonic Progress
// "head_new >= head_old, tail_new >= tail_old"
// =============================================================================

proptest! {
    /// `len()` changes predictably: up by exactly one on a successful
    /// reserve+commit, down on a non-empty consume.
    #[test]
    fn prop_monotonic_progress_spsc(
        ops in prop::collection::vec(prop::bool::ANY, 1..80),
    ) {
        let ring = Spsc::<u64>::new(Config::default());

        for write_op in ops {
            let len_before = ring.len();

            if write_op {
                if let Some(mut r) = ring.reserve(1) {
                    r.as_mut_slice()[0] = MaybeUninit::new(42);
                    r.commit();
                    prop_assert_eq!(ring.len(), len_before + 1);
                }
            } else {
                let consumed = ring.consume_batch(|_| {});
                if consumed > 0 {
                    prop_assert!(ring.len() < len_before);
                }
            }
        }
    }

    /// Same property against `Mpmc`'s CAS'd counters.
    #[test]
    fn prop_monotonic_progress_mpmc(
        ops in prop::collection::vec(prop::bool::ANY, 1..80),
    ) {
        let queue = Mpmc::<u64>::new(Config::default());

        for write_op in ops {
            let len_before = queue.len();

            if write_op {
                if queue.try_enqueue(42) {
                    prop_assert_eq!(queue.len(), len_before + 1);
                }
            } else if queue.try_dequeue().is_some() {
                prop_assert!(queue.len() < len_before);
            }
        }
    }
}

// =============================================================================
// INV-ORD-03: Happens-Before
// "head <= tail" (a consumer never reads ahead of a producer)
// =============================================================================

proptest! {
    /// Cannot consume more than was produced, and the ring drains to empty.
    #[test]
    fn prop_happens_before_spsc(
        writes in 0usize..200,
    ) {
        let ring = Spsc::<u64>::new(Config::default());

        let mut produced = 0;
        for i in 0..writes {
            if let Some(mut r) = ring.reserve(1) {
                r.as_mut_slice()[0] = MaybeUninit::new(i as u64);
                r.commit();
                produced += 1;
            }
        }

        prop_assert_eq!(ring.len(), produced);

        let mut consumed = 0;
        ring.consume_batch(|_| consumed += 1);

        prop_assert!(consumed <= produced);
        prop_assert!(ring.is_empty());
    }

    /// Same property against `Mpmc`.
    #[test]
    fn prop_happens_before_mpmc(
        writes in 0usize..200,
    ) {
        let queue = Mpmc::<u64>::new(Config::default());

        let mut produced = 0;
        for i in 0..writes {
            if queue.try_enqueue(i as u64) {
                produced += 1;
            }
        }

        let mut consumed = 0;
        while queue.try_dequeue().is_some() {
            consumed += 1;
        }

        prop_assert!(consumed <= produced);
        prop_assert!(queue.is_empty());
    }
}

// =============================================================================
// INV-RES-01: Partial Reservation (wrap-around behavior)
// "reserve(n) may return len() < n due to buffer wrap-around"
// =============================================================================

proptest! {
    /// `Spsc::reserve` never hands back more than requested or more than
    /// the space actually available, and never an empty-but-`Some`
    /// reservation.
    #[test]
    fn prop_partial_reservation(
        request_size in 1usize..100,
        pre_fill in 0usize..50,
    ) {
        let ring = Spsc::<u64>::new(Config::new(64, false));
        let capacity = ring.capacity();

        let actual_fill = pre_fill.min(capacity);
        for i in 0..actual_fill {
            if let Some(mut r) = ring.reserve(1) {
                r.as_mut_slice()[0] = MaybeUninit::new(i as u64);
                r.commit();
            }
        }

        let available = capacity - ring.len();
        if let Some(r) = ring.reserve(request_size) {
            let got = r.len();
            prop_assert!(got <= request_size,
                "got {} > requested {}", got, request_size);
            prop_assert!(got <= available,
                "got {} > available {}", got, available);
            prop_assert!(got > 0, "empty reservation returned as Some");
            // Dropped without commit: must not publish anything.
        }
    }
}
