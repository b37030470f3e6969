//! The bucket table and the linear hashing machinery.
//!
//! The table is an append-only sequence of boxed buckets together with the
//! split state `(init_size, depth, split_ptr)`. Everything about placement
//! lives here: the hash function, the address computation, and the
//! single-bucket split step. Locking policy and the public operations live
//! in the crate root; nothing in this module takes a lock on its own.

use parking_lot::RwLock;
use seahash::SeaHasher;
use std::hash::{Hash, Hasher};
use std::mem;

/// Hash a key.
///
/// We use SeaHash, which is cheap, well-distributed, and emits a full
/// 64-bit word, so the address computation never runs out of low bits to
/// consume as the table deepens. The function is deterministic: the bucket
/// an entry belongs in can be recomputed at any time and compared against
/// the bucket it actually sits in.
pub fn hash_key<Q: ?Sized + Hash>(key: &Q) -> u64 {
    let mut hasher = SeaHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A key-value pair.
#[derive(Clone)]
pub struct Entry<K, V> {
    /// The key.
    pub key: K,
    /// The value it maps to.
    pub val: V,
}

/// A bucket of entries.
///
/// The entry sequence is semantically unordered and keys are unique within
/// it. The lock protects the sequence itself, not merely its length:
/// pushes and swap-removals move entries around in memory.
pub struct Bucket<K, V> {
    /// The entries of the bucket.
    pub entries: RwLock<Vec<Entry<K, V>>>,
}

impl<K, V> Bucket<K, V> {
    /// Create an empty bucket.
    pub fn new() -> Bucket<K, V> {
        Bucket {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Create a bucket holding the given entries.
    pub fn with_entries(entries: Vec<Entry<K, V>>) -> Bucket<K, V> {
        Bucket {
            entries: RwLock::new(entries),
        }
    }
}

/// The bucket table.
///
/// Invariant: `buckets.len() == (init_size << depth) + split_ptr`. The
/// buckets are boxed so appending new ones never relocates a bucket some
/// other thread holds a reference into. Buckets are only ever appended;
/// the table does not shrink.
pub struct Table<K, V> {
    /// The buckets.
    pub buckets: Vec<Box<Bucket<K, V>>>,
    /// The initial bucket count, a power of two.
    pub init_size: usize,
    /// The number of completed split rounds.
    ///
    /// Each completed round doubled the table, so the current round starts
    /// from `init_size << depth` buckets and consumes one more low hash
    /// bit than the last.
    pub depth: usize,
    /// The index of the next bucket to split.
    pub split_ptr: usize,
}

impl<K, V> Table<K, V> {
    /// Create a table of `init_size` empty buckets.
    pub fn new(init_size: usize) -> Table<K, V> {
        let mut buckets = Vec::with_capacity(init_size);
        for _ in 0..init_size {
            buckets.push(Box::new(Bucket::new()));
        }

        Table {
            buckets: buckets,
            init_size: init_size,
            depth: 0,
            split_ptr: 0,
        }
    }

    /// Map a hash to the index of the bucket hosting it.
    ///
    /// Buckets below `split_ptr` were already split this round, so their
    /// keys are addressed with one extra low bit. That extra bit is what
    /// routes a key into one of the sibling buckets appended at the end of
    /// the table; buckets at or above `split_ptr` are still addressed at
    /// the round's base width.
    pub fn bucket_index(&self, hash: u64) -> usize {
        let mask = (self.init_size << self.depth) as u64 - 1;
        let index = hash & mask;

        if (index as usize) < self.split_ptr {
            (hash & (mask << 1 | 1)) as usize
        } else {
            index as usize
        }
    }

    /// Resolve the bucket a key belongs in.
    pub fn bucket_for<Q: ?Sized + Hash>(&self, key: &Q) -> &Bucket<K, V> {
        &self.buckets[self.bucket_index(hash_key(key))]
    }
}

impl<K: Hash, V> Table<K, V> {
    /// Split one bucket.
    ///
    /// Appends a fresh sibling, then rehashes the bucket at `split_ptr`
    /// against the newly significant bit: entries with the bit set move to
    /// the sibling, the rest are rebuilt into the source wholesale. When
    /// the split pointer reaches the end of the round it wraps to zero and
    /// `depth` advances, doubling the base width for the next round.
    ///
    /// The caller must hold the table exclusively. With no operation in
    /// flight the bucket locks cannot be contended, so the entries are
    /// reached through `get_mut` without locking.
    pub fn split_one(&mut self) {
        let hi_bit = (self.init_size << self.depth) as u64;

        self.buckets.push(Box::new(Bucket::new()));
        let sibling = self.buckets.len() - 1;

        let drained = mem::replace(self.buckets[self.split_ptr].entries.get_mut(), Vec::new());
        let mut retained = Vec::with_capacity(drained.len());
        let mut moved = Vec::new();

        for entry in drained {
            if hash_key(&entry.key) & hi_bit == 0 {
                retained.push(entry);
            } else {
                moved.push(entry);
            }
        }

        *self.buckets[self.split_ptr].entries.get_mut() = retained;
        *self.buckets[sibling].entries.get_mut() = moved;

        self.split_ptr += 1;
        if self.split_ptr == self.init_size << self.depth {
            self.split_ptr = 0;
            self.depth += 1;
        }
    }
}
