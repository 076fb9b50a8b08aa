use thiserror::Error;

/// Error returned by `SegmentedQueue::enqueue` on a fixed-size queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SegmentedQueueError {
    /// The queue was constructed with `fixed_size: true` and its single
    /// segment is full; the checked `enqueue` raises this instead of
    /// silently growing.
    #[error("queue full")]
    Full,
}

/// Error returned by the hash set's uniqueness-checked insertion methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HashSetError {
    /// `add` requires the key to be absent; `try_add` returns `false`
    /// instead of this for the same condition.
    #[error("key already present")]
    DuplicateKey,
}

/// Error surfaced by a running (non-snapshot) enumerator when the
/// collection's head has moved since the enumerator was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnumerationError {
    #[error("collection was modified during enumeration")]
    ConcurrentModification,
}
