use crate::config::{HashSetConfig, DEFAULT_CAPACITY, MAX_LOCK_NUMBER};
use crate::error::HashSetError;
use crate::invariants::debug_assert_lock_count_bounded;
use crate::metrics::ResizeMetrics;
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// Striped concurrent hash set (spec.md §4.5)
// =============================================================================
//
// Bucket heads are `ArcSwapOption<Node<T>>` over an immutable singly-linked
// list: a `Node` holds an `Arc<T>`, never `T` itself, so unlinking a node on
// remove only ever clones `Arc` pointers to rebuild the unaffected prefix of
// a chain, regardless of whether `T: Clone`. `contains_key` walks this list
// under nothing but the acquire loads the chain already requires, making it
// genuinely lock-free; writers serialize only through the (separately
// sized) stripe-lock array, never through a per-bucket lock.
//
// `Tables` — the bucket array plus its Lemire fast-modulo multiplier — is
// itself swapped wholesale on resize via `ArcSwap`, so a reader never
// observes a torn bucket array.

/// Caps a bucket-array resize, standing in for the upstream source's
/// `HashHelpers.MaxPrimeArrayLength`: large enough that no realistic
/// workload reaches it, while keeping `new_len` an honest `usize`.
const MAX_BUCKET_ARRAY_LEN: usize = 0x7FEF_FFFD;

struct Node<T> {
    key: Arc<T>,
    hashcode: u64,
    next: Option<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn shallow_clone(&self, next: Option<Arc<Node<T>>>) -> Arc<Node<T>> {
        Arc::new(Node {
            key: Arc::clone(&self.key),
            hashcode: self.hashcode,
            next,
        })
    }
}

/// Lemire's fast range reduction: precompute `m = floor(2^64 / d) + 1` once
/// per `Tables` generation, then replace `hashcode % d` with a single
/// 64x64-bit multiply plus a 128-bit widen (spec.md §9's "Fast modulo").
#[inline]
fn fastmod_multiplier(d: u64) -> u64 {
    (u64::MAX / d).wrapping_add(1)
}

#[inline]
fn fastmod(a: u64, m: u64, d: u64) -> u64 {
    let lowbits = m.wrapping_mul(a);
    (((lowbits as u128) * (d as u128)) >> 64) as u64
}

/// Bucket array, Lemire multiplier, stripe locks and their per-stripe
/// counters — everything a reader or writer needs to act on a single
/// resize generation, swapped in as one unit so a `lock_idx` computed
/// against this `Tables` is always paired with the lock count it was
/// computed against (see DESIGN.md's `grow_lock_array` resolution).
struct Tables<T> {
    buckets: Box<[ArcSwapOption<Node<T>>]>,
    multiplier: u64,
    locks: Box<[Mutex<()>]>,
    count_per_lock: Box<[AtomicUsize]>,
}

impl<T> Tables<T> {
    fn new(len: usize, lock_count: usize) -> Self {
        let len = len.max(1);
        let lock_count = lock_count.max(1);
        Self {
            buckets: (0..len).map(|_| ArcSwapOption::const_empty()).collect(),
            multiplier: fastmod_multiplier(len as u64),
            locks: (0..lock_count).map(|_| Mutex::new(())).collect(),
            count_per_lock: (0..lock_count).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    fn bucket_index(&self, hashcode: u64) -> usize {
        fastmod(hashcode, self.multiplier, self.buckets.len() as u64) as usize
    }

    #[inline]
    fn lock_index(&self, bucket_idx: usize) -> usize {
        bucket_idx % self.locks.len()
    }
}

/// Unlinks the first node matching `hashcode`/`key`, if any. Returns
/// `Some(new_head)` on success (only the prefix up to and including the
/// removed node is rebuilt; the tail past it is shared, not cloned), or
/// `None` if the chain had no matching node.
fn remove_from_chain<T: PartialEq>(
    head: Option<Arc<Node<T>>>,
    hashcode: u64,
    key: &T,
) -> Option<Option<Arc<Node<T>>>> {
    let mut prefix = Vec::new();
    let mut cur = head;

    loop {
        match cur {
            None => return None,
            Some(node) => {
                if node.hashcode == hashcode && node.key.as_ref() == key {
                    let mut new_tail = node.next.clone();
                    for ancestor in prefix.into_iter().rev() {
                        new_tail = Some(Node::shallow_clone(&ancestor, new_tail));
                    }
                    return Some(new_tail);
                }
                cur = node.next.clone();
                prefix.push(node);
            }
        }
    }
}

/// Striped-locking concurrent hash set with lock-free reads (spec.md §4.5).
///
/// Writes (`try_add`, `try_remove`) serialize per-stripe via a small
/// `parking_lot::Mutex` array, independent in size from the bucket array;
/// `contains_key` never takes a lock.
pub struct ConcurrentHashSet<T, S = RandomState> {
    tables: ArcSwap<Tables<T>>,
    budget: AtomicUsize,
    grow_lock_array: bool,
    hasher: S,
    resize_metrics: ResizeMetrics,
}

unsafe impl<T: Send, S: Send> Send for ConcurrentHashSet<T, S> {}
unsafe impl<T: Send + Sync, S: Sync> Sync for ConcurrentHashSet<T, S> {}

impl<T: Hash + Eq> ConcurrentHashSet<T, RandomState> {
    #[must_use]
    pub fn new(config: HashSetConfig) -> Self {
        Self::with_hasher(config, RandomState::new())
    }

    /// Seeded construction (spec.md §6's `new(collection)`).
    #[must_use]
    pub fn new_from(config: HashSetConfig, items: impl IntoIterator<Item = T>) -> Self {
        let set = Self::new(config);
        for item in items {
            let _ = set.try_add(item);
        }
        set
    }
}

impl<T: Hash + Eq, S: BuildHasher> ConcurrentHashSet<T, S> {
    /// # Panics
    ///
    /// Panics if `config.concurrency_level` is zero (already excluded by
    /// [`HashSetConfig::new`]'s own assertion).
    #[must_use]
    pub fn with_hasher(config: HashSetConfig, hasher: S) -> Self {
        let lock_count = config.concurrency_level.clamp(1, MAX_LOCK_NUMBER);
        debug_assert_lock_count_bounded!(lock_count, MAX_LOCK_NUMBER);
        let budget = (config.initial_capacity / lock_count).max(1);

        Self {
            tables: ArcSwap::new(Arc::new(Tables::new(config.initial_capacity, lock_count))),
            budget: AtomicUsize::new(budget),
            grow_lock_array: config.grow_lock_array,
            hasher,
            resize_metrics: ResizeMetrics::new(),
        }
    }

    #[inline]
    fn hash_of(&self, key: &T) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    /// Lock-free containment check (spec.md §4.5's `ContainsKey`).
    #[must_use]
    pub fn contains_key(&self, key: &T) -> bool {
        let hashcode = self.hash_of(key);
        let tables = self.tables.load_full();
        let bucket_idx = tables.bucket_index(hashcode);
        let mut cur = tables.buckets[bucket_idx].load_full();
        while let Some(node) = cur {
            if node.hashcode == hashcode && node.key.as_ref() == key {
                return true;
            }
            cur = node.next.clone();
        }
        false
    }

    /// Inserts `key` if absent. Returns `false` without modifying the set
    /// if it was already present (spec.md §4.5's `TryAdd`).
    pub fn try_add(&self, key: T) -> bool {
        let hashcode = self.hash_of(&key);
        let mut key = Some(key);

        loop {
            let tables = self.tables.load_full();
            let bucket_idx = tables.bucket_index(hashcode);
            let lock_idx = tables.lock_index(bucket_idx);
            let guard = tables.locks[lock_idx].lock();

            if !Arc::ptr_eq(&self.tables.load_full(), &tables) {
                drop(guard);
                continue;
            }

            let head = tables.buckets[bucket_idx].load_full();
            let mut cur = head.clone();
            while let Some(node) = cur {
                if node.hashcode == hashcode && node.key.as_ref() == key.as_ref().expect("key consumed exactly once") {
                    return false;
                }
                cur = node.next.clone();
            }

            let new_node = Arc::new(Node {
                key: Arc::new(key.take().expect("key consumed exactly once")),
                hashcode,
                next: head,
            });
            tables.buckets[bucket_idx].store(Some(new_node));
            let count = tables.count_per_lock[lock_idx].fetch_add(1, Ordering::Relaxed) + 1;
            let needs_resize = count > self.budget.load(Ordering::Relaxed);
            drop(guard);

            if needs_resize {
                self.grow(tables);
            }
            return true;
        }
    }

    /// As [`Self::try_add`], but raises [`HashSetError::DuplicateKey`]
    /// instead of returning `false` (spec.md §7's `ContractViolation`).
    pub fn add(&self, key: T) -> Result<(), HashSetError> {
        if self.try_add(key) {
            Ok(())
        } else {
            Err(HashSetError::DuplicateKey)
        }
    }

    /// Removes `key` if present. Returns whether it was found.
    pub fn try_remove(&self, key: &T) -> bool {
        let hashcode = self.hash_of(key);

        loop {
            let tables = self.tables.load_full();
            let bucket_idx = tables.bucket_index(hashcode);
            let lock_idx = tables.lock_index(bucket_idx);
            let guard = tables.locks[lock_idx].lock();

            if !Arc::ptr_eq(&self.tables.load_full(), &tables) {
                drop(guard);
                continue;
            }

            let head = tables.buckets[bucket_idx].load_full();
            match remove_from_chain(head, hashcode, key) {
                Some(new_head) => {
                    tables.buckets[bucket_idx].store(new_head);
                    tables.count_per_lock[lock_idx].fetch_sub(1, Ordering::Relaxed);
                    return true;
                }
                None => return false,
            }
        }
    }

    pub fn remove(&self, key: &T) -> bool {
        self.try_remove(key)
    }

    /// Test-and-set: returns `true` if `key` was already present (no
    /// mutation), `false` if it was just inserted (spec.md §6).
    pub fn contains_or_add(&self, key: T) -> bool {
        !self.try_add(key)
    }

    /// Matches spec.md §4.5's `Grow`: acquires `locks[0]` first to detect a
    /// concurrent resize, widens the budget instead of resizing if
    /// occupancy is low, otherwise grows the bucket array (and optionally
    /// the lock array) under every stripe lock held ascending, rehashes,
    /// and publishes the new `Tables` before releasing the locks in
    /// reverse.
    fn grow(&self, old_tables: Arc<Tables<T>>) {
        let guard0 = old_tables.locks[0].lock();

        if !Arc::ptr_eq(&self.tables.load_full(), &old_tables) {
            return;
        }

        let total: usize = old_tables
            .count_per_lock
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum();
        if total < old_tables.buckets.len() / 4 {
            let widened = self.budget.load(Ordering::Relaxed).saturating_mul(2).min(i32::MAX as usize);
            self.budget.store(widened, Ordering::Relaxed);
            return;
        }

        let mut new_len = old_tables.buckets.len().saturating_mul(2) + 1;
        while new_len % 3 == 0 || new_len % 5 == 0 || new_len % 7 == 0 {
            new_len += 2;
        }
        let overflowed = new_len > MAX_BUCKET_ARRAY_LEN;
        let new_len = new_len.min(MAX_BUCKET_ARRAY_LEN);

        let new_lock_count = if self.grow_lock_array {
            (old_tables.locks.len() * 2).min(MAX_LOCK_NUMBER)
        } else {
            old_tables.locks.len()
        };
        debug_assert_lock_count_bounded!(new_lock_count, MAX_LOCK_NUMBER);

        let mut rest_guards = Vec::with_capacity(old_tables.locks.len() - 1);
        for lock in &old_tables.locks[1..] {
            rest_guards.push(lock.lock());
        }

        let new_tables = Tables::new(new_len, new_lock_count);
        for bucket in old_tables.buckets.iter() {
            let mut cur = bucket.load_full();
            while let Some(node) = cur {
                let idx = new_tables.bucket_index(node.hashcode);
                let existing = new_tables.buckets[idx].load_full();
                new_tables.buckets[idx].store(Some(node.shallow_clone(existing)));
                let lock_idx = new_tables.lock_index(idx);
                new_tables.count_per_lock[lock_idx].fetch_add(1, Ordering::Relaxed);
                cur = node.next.clone();
            }
        }

        self.tables.store(Arc::new(new_tables));
        self.resize_metrics.add_resize();

        let new_budget = if overflowed {
            i32::MAX as usize
        } else {
            (new_len / new_lock_count).max(1)
        };
        self.budget.store(new_budget, Ordering::Relaxed);

        rest_guards.reverse();
        drop(rest_guards);
        drop(guard0);
    }

    /// Acquires every stripe lock and replaces `tables` with a fresh,
    /// default-capacity one, reusing the existing lock array (spec.md
    /// §4.5's `Clear`).
    pub fn clear(&self) {
        let tables = self.tables.load_full();
        let _guards: Vec<_> = tables.locks.iter().map(Mutex::lock).collect();
        let lock_count = tables.locks.len();
        self.tables.store(Arc::new(Tables::new(DEFAULT_CAPACITY, lock_count)));
        self.budget
            .store((DEFAULT_CAPACITY / lock_count).max(1), Ordering::Relaxed);
    }

    /// Acquires every stripe lock and sums the per-stripe counts (spec.md
    /// §4.5's `Count`).
    #[must_use]
    pub fn count(&self) -> usize {
        let tables = self.tables.load_full();
        let _guards: Vec<_> = tables.locks.iter().map(Mutex::lock).collect();
        tables.count_per_lock.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Fast lock-free path first; if it reports zero, re-confirms under
    /// every stripe lock to rule out an add whose node was published but
    /// whose counter increment had not yet landed (spec.md §4.5's
    /// `IsEmpty`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let tables = self.tables.load_full();
        let looks_empty = tables
            .count_per_lock
            .iter()
            .all(|c| c.load(Ordering::Relaxed) == 0);
        if !looks_empty {
            return false;
        }
        let _guards: Vec<_> = tables.locks.iter().map(Mutex::lock).collect();
        tables.count_per_lock.iter().all(|c| c.load(Ordering::Relaxed) == 0)
    }

    /// Snapshot copy of every element, acquiring every stripe lock for the
    /// duration of the walk (spec.md §4.5's `ToArray`).
    #[must_use]
    pub fn to_array(&self) -> Vec<T>
    where
        T: Clone,
    {
        let tables = self.tables.load_full();
        let _guards: Vec<_> = tables.locks.iter().map(Mutex::lock).collect();
        let mut out = Vec::new();
        for bucket in tables.buckets.iter() {
            let mut cur = bucket.load_full();
            while let Some(node) = cur {
                out.push((*node.key).clone());
                cur = node.next.clone();
            }
        }
        out
    }

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

    /// Lock-free, non-snapshot enumeration: walks bucket by bucket using
    /// acquire-loads of head pointers, possibly observing concurrent
    /// inserts/removes (spec.md §4.5's `Enumeration`).
    #[must_use]
    pub fn iterate(&self) -> HashSetIter<T>
    where
        T: Clone,
    {
        HashSetIter {
            tables: self.tables.load_full(),
            bucket: 0,
            current: None,
        }
    }

    #[must_use]
    pub fn concurrency_level(&self) -> usize {
        self.tables.load_full().locks.len()
    }

    #[must_use]
    pub fn resize_metrics(&self) -> &ResizeMetrics {
        &self.resize_metrics
    }
}

/// Running, lock-free enumerator (spec.md §9): not a snapshot, may
/// interleave with concurrent writers on the buckets it has not yet
/// visited. Bucket heads are read fresh on each step; the bucket array
/// itself is the one fixed at the moment [`ConcurrentHashSet::iterate`]
/// was called, so a concurrent resize is not reflected mid-enumeration.
pub struct HashSetIter<T> {
    tables: Arc<Tables<T>>,
    bucket: usize,
    current: Option<Arc<Node<T>>>,
}

impl<T: Clone> Iterator for HashSetIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(node) = self.current.take() {
                self.current = node.next.clone();
                return Some((*node.key).clone());
            }
            if self.bucket >= self.tables.buckets.len() {
                return None;
            }
            self.current = self.tables.buckets[self.bucket].load_full();
            self.bucket += 1;
        }
    }
}
