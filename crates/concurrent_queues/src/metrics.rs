use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for a single ring-protocol collection.
///
/// Each field is an independent atomic so producers and the consumer can
/// update their halves without contending on a shared cache line; enabling
/// this (via `Config::enable_metrics`) costs one extra relaxed
/// fetch-add per batch, never per item.
#[derive(Default)]
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    batches_sent: AtomicU64,
    batches_received: AtomicU64,
    reserve_spins: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_messages_sent(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_messages_received(&self, n: u64) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_batches_sent(&self, n: u64) {
        self.batches_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_batches_received(&self, n: u64) {
        self.batches_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_reserve_spin(&self) {
        self.reserve_spins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
            reserve_spins: self.reserve_spins.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of a collection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub batches_sent: u64,
    pub batches_received: u64,
    pub reserve_spins: u64,
}

impl std::ops::AddAssign for MetricsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.messages_sent += rhs.messages_sent;
        self.messages_received += rhs.messages_received;
        self.batches_sent += rhs.batches_sent;
        self.batches_received += rhs.batches_received;
        self.reserve_spins += rhs.reserve_spins;
    }
}

/// Counters for the hash set's resize path and the segmented queue's growth
/// path, tracked separately because they have nothing to do with message
/// throughput.
#[derive(Default)]
pub struct ResizeMetrics {
    resizes: AtomicU64,
    segments_live: AtomicU64,
}

impl ResizeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_resize(&self) {
        self.resizes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resizes(&self) -> u64 {
        self.resizes.load(Ordering::Relaxed)
    }

    /// Records a new segment being linked onto the chain (initial
    /// construction or growth). Best-effort, like the rest of this
    /// module's counters: a racing `segment_count()` walk is the
    /// authoritative answer, this is the O(1) diagnostic one.
    pub(crate) fn segment_linked(&self) {
        self.segments_live.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a segment falling off the head of the chain once it is
    /// fully drained and frozen.
    pub(crate) fn segment_retired(&self) {
        self.segments_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_segments_live(&self, n: u64) {
        self.segments_live.store(n, Ordering::Relaxed);
    }

    pub fn segments_live(&self) -> u64 {
        self.segments_live.load(Ordering::Relaxed)
    }
}
