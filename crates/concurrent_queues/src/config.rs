/// Configuration shared by the bounded ring collections (SPSC, MPSC, MPMC).
///
/// Capacity is rounded up to the next power of two so that index wrapping
/// can be done with a bitmask instead of a modulo.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    capacity_bits: u8,
    pub enable_metrics: bool,
}

impl Config {
    /// Creates a new configuration for the given requested capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or rounds up past 2^30 slots.
    #[must_use]
    pub const fn new(capacity: usize, enable_metrics: bool) -> Self {
        assert!(capacity >= 1, "capacity must be at least 1");
        let capacity = capacity.next_power_of_two();
        assert!(
            capacity <= (1 << 30),
            "capacity must not exceed 2^30 slots"
        );
        Self {
            capacity_bits: capacity.trailing_zeros() as u8,
            enable_metrics,
        }
    }

    /// Returns the ring buffer capacity (always a power of two).
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        1usize << self.capacity_bits
    }

    /// Returns the index mask for wrapping.
    #[inline]
    pub(crate) const fn mask(&self) -> usize {
        self.capacity() - 1
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(1024, false)
    }
}

/// Tuned for minimal per-item latency: a small ring that stays resident in L1.
pub const LOW_LATENCY_CONFIG: Config = Config::new(4096, false);

/// Tuned for sustained throughput at the cost of per-item latency.
pub const HIGH_THROUGHPUT_CONFIG: Config = Config::new(1 << 18, false);

/// Initial length of the first segment in a `SegmentedQueue`.
pub const INITIAL_SEGMENT_LENGTH: usize = 32;

/// Largest a segment is allowed to grow to before growth stops doubling.
pub const MAX_SEGMENT_LENGTH: usize = 1 << 20;

/// Configuration for the unbounded segmented MPMC queue.
#[derive(Debug, Clone, Copy)]
pub struct SegmentedConfig {
    initial_len_bits: u8,
    /// If `true`, the queue never grows past its first segment's capacity:
    /// `enqueue` returns/raises a "queue full" condition instead of
    /// allocating a successor segment.
    pub fixed_size: bool,
    pub enable_metrics: bool,
}

impl SegmentedConfig {
    /// Creates a new configuration. `initial_capacity` is rounded up to the
    /// next power of two and clamped to `MAX_SEGMENT_LENGTH`.
    ///
    /// # Panics
    ///
    /// Panics if `initial_capacity` is zero.
    #[must_use]
    pub const fn new(initial_capacity: usize, fixed_size: bool) -> Self {
        assert!(initial_capacity >= 1, "initial_capacity must be at least 1");
        let capacity = if initial_capacity.next_power_of_two() < MAX_SEGMENT_LENGTH {
            initial_capacity.next_power_of_two()
        } else {
            MAX_SEGMENT_LENGTH
        };
        Self {
            initial_len_bits: capacity.trailing_zeros() as u8,
            fixed_size,
            enable_metrics: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn initial_length(&self) -> usize {
        1usize << self.initial_len_bits
    }
}

impl Default for SegmentedConfig {
    fn default() -> Self {
        Self::new(INITIAL_SEGMENT_LENGTH, false)
    }
}

/// Default bucket-array size for a freshly constructed `ConcurrentHashSet`,
/// matching the source lineage's own default (a small prime).
pub const DEFAULT_CAPACITY: usize = 31;

/// Hard ceiling on the number of stripe locks, regardless of requested
/// concurrency level.
pub const MAX_LOCK_NUMBER: usize = 1024;

/// Configuration for the striped `ConcurrentHashSet`.
#[derive(Debug, Clone, Copy)]
pub struct HashSetConfig {
    pub initial_capacity: usize,
    pub concurrency_level: usize,
    /// Whether `Grow` is allowed to double the stripe-lock array (up to
    /// `MAX_LOCK_NUMBER`) in addition to the bucket array.
    pub grow_lock_array: bool,
}

impl HashSetConfig {
    /// # Panics
    ///
    /// Panics if `concurrency_level` is zero.
    #[must_use]
    pub const fn new(initial_capacity: usize, concurrency_level: usize, grow_lock_array: bool) -> Self {
        assert!(concurrency_level >= 1, "concurrency_level must be at least 1");
        let initial_capacity = if initial_capacity > 1 { initial_capacity } else { 1 };
        let concurrency_level = if concurrency_level < MAX_LOCK_NUMBER {
            concurrency_level
        } else {
            MAX_LOCK_NUMBER
        };
        Self {
            initial_capacity,
            concurrency_level,
            grow_lock_array,
        }
    }
}

impl Default for HashSetConfig {
    fn default() -> Self {
        let concurrency_level = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self::new(DEFAULT_CAPACITY, concurrency_level, false)
    }
}
