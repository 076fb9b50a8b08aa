//! Concurrent, bounded and unbounded FIFO queues plus a concurrent
//! unordered set, built for low-overhead, predominantly lock-free
//! coordination between producer and consumer threads.
//!
//! - [`Spsc`]: single-producer/single-consumer bounded ring.
//! - [`Mpsc`]: multi-producer/single-consumer bounded ring, CAS on the
//!   producer side only.
//! - [`Mpmc`]: multi-producer/multi-consumer bounded ring, CAS on both
//!   ends.
//! - [`SegmentedQueue`]: unbounded (or capped) multi-producer/multi-consumer
//!   queue built from linked, growable ring segments.
//! - [`ConcurrentHashSet`]: striped-locking hash set with lock-free reads.
//!
//! Ordering across distinct producers is not promised, only per-producer
//! FIFO. `count`/`len` are best-effort snapshots under concurrent mutation.
//! None of these collections block: every operation either succeeds, fails
//! fast, or spins briefly while a peer finishes publishing.

mod backoff;
mod cache_pad;
mod config;
mod error;
mod hashset;
mod invariants;
mod metrics;
mod mpmc;
mod mpsc;
mod reservation;
mod segmented;
mod spsc;

pub use backoff::Backoff;
pub use config::{
    Config, HashSetConfig, SegmentedConfig, DEFAULT_CAPACITY, HIGH_THROUGHPUT_CONFIG,
    INITIAL_SEGMENT_LENGTH, LOW_LATENCY_CONFIG, MAX_LOCK_NUMBER, MAX_SEGMENT_LENGTH,
};
pub use error::{EnumerationError, HashSetError, SegmentedQueueError};
pub use hashset::ConcurrentHashSet;
pub use metrics::{Metrics, MetricsSnapshot, ResizeMetrics};
pub use mpmc::Mpmc;
pub use mpsc::Mpsc;
pub use reservation::Reservation;
pub use segmented::SegmentedQueue;
pub use spsc::Spsc;
