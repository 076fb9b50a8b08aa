use crate::spsc::Spsc;
use std::mem::MaybeUninit;

/// Zero-copy reservation for writing directly into an `Spsc` ring buffer.
///
/// The producer obtains a reservation, writes data into the provided slice,
/// then commits to make the data visible to the consumer. Only `Spsc`
/// exposes this: with a single writer, the reserved region is guaranteed
/// contiguous and uncontended, which is not true once a second producer can
/// reserve concurrently (see `Mpsc`/`Mpmc`, which commit one slot at a time
/// under the sequence-number protocol instead).
///
/// **Important:** A `Reservation` may contain fewer items than requested
/// from `reserve(n)` if the reservation wraps around the ring buffer
/// boundary. Always check `as_mut_slice().len()` to determine how many
/// items were actually reserved.
///
/// # Example
///
/// ```ignore
/// // Request 100 items but might get fewer
/// if let Some(mut reservation) = ring.reserve(100) {
///     let slice = reservation.as_mut_slice();
///     let actual = slice.len(); // May be < 100!
///
///     for item in slice.iter_mut() {
///         *item = MaybeUninit::new(some_value);
///     }
///
///     reservation.commit(); // Commits `actual` items
/// }
/// ```
pub struct Reservation<'a, T> {
    slice: &'a mut [MaybeUninit<T>],
    ring_ptr: *const Spsc<T>,
    len: usize,
}

impl<'a, T> Reservation<'a, T> {
    /// Creates a new reservation.
    pub(crate) fn new(slice: &'a mut [MaybeUninit<T>], ring_ptr: *const Spsc<T>) -> Self {
        let len = slice.len();
        Self {
            slice,
            ring_ptr,
            len,
        }
    }

    /// Returns a mutable slice for writing data.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [MaybeUninit<T>] {
        self.slice
    }

    /// Returns the number of reserved slots.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the reservation is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Commits the reservation, making data visible to the consumer.
    pub fn commit(self) {
        let len = self.len;
        self.commit_n(len);
    }

    /// Commits `n` items (where `n <= len()`). Lets a producer commit fewer
    /// items than reserved, e.g. after a short write.
    ///
    /// # Panics
    ///
    /// Panics if `n` is greater than the number of reserved slots.
    pub fn commit_n(self, n: usize) {
        assert!(n <= self.len, "cannot commit more than reserved");
        // SAFETY: `ring_ptr` was derived from a live `&Spsc<T>` by
        // `Spsc::make_reservation` and this `Reservation` cannot outlive it
        // (the slice borrow ties its lifetime to the ring).
        unsafe {
            let ring = &*self.ring_ptr;
            ring.commit_internal(n);
        }
    }
}
