//! A concurrent hash map that grows one bucket at a time.
//!
//! `LHashMap` is a concurrent associative container based on linear
//! hashing: instead of rehashing the whole table when it fills up, it
//! splits a single bucket per overloaded insertion, in round-robin order.
//! Growth cost is spread evenly over the insertions that cause it, so no
//! single operation ever pays for a full rehash.
//!
//! # Design
//!
//! The map is a sequence of buckets, each an unordered vector of entries
//! behind its own reader-writer lock, with a global reader-writer lock
//! around the whole table. Ordinary operations hold the table lock shared
//! and the one relevant bucket lock in the required mode, so readers run
//! in parallel everywhere and writers run in parallel on distinct buckets.
//! Only a split takes the table lock exclusively, and it does so after the
//! triggering insertion has released everything, so no thread ever blocks
//! while holding two exclusive locks.
//!
//! Addressing works on the low bits of the hash. A split pointer walks the
//! table: buckets it has passed are addressed with one more bit than
//! buckets it has not reached, which is exactly what makes a half-grown
//! table consistent. When the pointer has walked a whole round, the table
//! has doubled and the next round begins.
//!
//! # Example
//!
//! ```rust
//! use lhashmap::LHashMap;
//!
//! let map = LHashMap::new();
//! map.insert("fish", 9);
//! map.insert("bird", 3);
//!
//! assert_eq!(*map.get("fish").unwrap(), 9);
//! assert_eq!(map.remove("bird"), Some(3));
//! assert!(!map.contains_key("bird"));
//! ```

#[macro_use]
extern crate quick_error;
extern crate owning_ref;
extern crate parking_lot;
extern crate seahash;

mod table;

use owning_ref::{OwningHandle, OwningRef};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::borrow::Borrow;
use std::hash::Hash;
use std::iter::FromIterator;
use std::sync::atomic::{self, AtomicUsize};
use std::{fmt, mem, ops, slice, vec};

use table::{Bucket, Entry, Table};

/// The atomic ordering used throughout the crate.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;
/// The default initial bucket count.
const DEFAULT_INITIAL_BUCKETS: usize = 2;
/// The default maximum load factor.
const DEFAULT_MAX_LOAD_FACTOR: f64 = 0.75;

quick_error! {
    /// A rejected construction option.
    #[derive(Debug, PartialEq, Eq)]
    pub enum OptionsError {
        /// The initial bucket count was zero or not a power of two.
        ///
        /// Addressing masks hashes with `bucket count - 1`, which only
        /// selects a contiguous run of low bits when the count is a power
        /// of two.
        InitialBuckets {
            display("initial bucket count must be a nonzero power of two")
        }
        /// The maximum load factor was zero, negative, or NaN.
        MaxLoadFactor {
            display("maximum load factor must be positive")
        }
    }
}

/// A shared guard for a value in the map.
///
/// While the guard is alive it holds the table lock and the bucket lock
/// shared, so the value can neither be mutated nor rehashed into another
/// bucket. Other readers proceed freely; writers to the same bucket wait.
///
/// Do not write to the map on the thread holding a guard: an insertion
/// into the guarded bucket would wait on the bucket lock forever, and a
/// split would wait on the table lock. Read what you need and drop it.
pub struct ReadGuard<'a, K: 'a, V: 'a> {
    /// The inner lock chain.
    ///
    /// The handle ties the bucket guard to the table guard that made it
    /// valid, and the owning reference narrows the pair down to a single
    /// value in the bucket.
    inner: OwningRef<
        OwningHandle<RwLockReadGuard<'a, Table<K, V>>, RwLockReadGuard<'a, Vec<Entry<K, V>>>>,
        V,
    >,
}

impl<'a, K, V> ops::Deref for ReadGuard<'a, K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner
    }
}

impl<'a, K, V: PartialEq> PartialEq for ReadGuard<'a, K, V> {
    fn eq(&self, other: &ReadGuard<'a, K, V>) -> bool {
        **self == **other
    }
}

impl<'a, K, V: Eq> Eq for ReadGuard<'a, K, V> {}

impl<'a, K, V: fmt::Debug> fmt::Debug for ReadGuard<'a, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ReadGuard({:?})", &**self)
    }
}

/// An exclusive guard for a value in the map.
///
/// Holds the table lock shared and the bucket lock exclusively, giving
/// mutable access to a single value in place. The same caveat as
/// [`ReadGuard`] applies, doubly: nobody can touch the bucket until the
/// guard is gone.
pub struct WriteGuard<'a, K: 'a, V: 'a> {
    /// The inner lock chain, narrowed to a mutable value reference.
    inner: OwningHandle<
        OwningHandle<RwLockReadGuard<'a, Table<K, V>>, RwLockWriteGuard<'a, Vec<Entry<K, V>>>>,
        &'a mut V,
    >,
}

impl<'a, K, V> ops::Deref for WriteGuard<'a, K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner
    }
}

impl<'a, K, V> ops::DerefMut for WriteGuard<'a, K, V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.inner
    }
}

impl<'a, K, V: PartialEq> PartialEq for WriteGuard<'a, K, V> {
    fn eq(&self, other: &WriteGuard<'a, K, V>) -> bool {
        **self == **other
    }
}

impl<'a, K, V: Eq> Eq for WriteGuard<'a, K, V> {}

impl<'a, K, V: fmt::Debug> fmt::Debug for WriteGuard<'a, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WriteGuard({:?})", &**self)
    }
}

/// A concurrent linear hashing map.
///
/// The table starts at a fixed power-of-two bucket count and appends one
/// bucket whenever an insertion pushes the load factor (entries per
/// bucket) over the configured maximum. Lookups, insertions, and removals
/// from any number of threads only contend when they hit the same bucket,
/// or when one of them is growing the table.
pub struct LHashMap<K, V> {
    /// The number of entries in the map.
    ///
    /// Kept outside the table lock so it can be bumped while holding the
    /// lock shared, and read with no lock at all.
    len: AtomicUsize,
    /// The load factor above which an insertion triggers a split.
    max_load_factor: f64,
    /// The bucket table.
    table: RwLock<Table<K, V>>,
}

impl<K, V> LHashMap<K, V> {
    /// Create a map with the default options.
    ///
    /// The defaults are two initial buckets and a maximum load factor of
    /// 0.75.
    pub fn new() -> LHashMap<K, V> {
        LHashMap::with_parts(DEFAULT_INITIAL_BUCKETS, DEFAULT_MAX_LOAD_FACTOR)
    }

    /// Create a map with the given initial bucket count and maximum load
    /// factor.
    ///
    /// The bucket count must be a nonzero power of two and the load factor
    /// must be positive; anything else is refused with the matching
    /// [`OptionsError`].
    pub fn with_options(
        initial_buckets: usize,
        max_load_factor: f64,
    ) -> Result<LHashMap<K, V>, OptionsError> {
        if !initial_buckets.is_power_of_two() {
            // `is_power_of_two` is false for zero, covering both halves of
            // the precondition.
            return Err(OptionsError::InitialBuckets);
        }
        if !(max_load_factor > 0.0) {
            return Err(OptionsError::MaxLoadFactor);
        }

        Ok(LHashMap::with_parts(initial_buckets, max_load_factor))
    }

    /// Create a map from already validated parts.
    fn with_parts(initial_buckets: usize, max_load_factor: f64) -> LHashMap<K, V> {
        LHashMap {
            len: AtomicUsize::new(0),
            max_load_factor: max_load_factor,
            table: RwLock::new(Table::new(initial_buckets)),
        }
    }

    /// Get the number of entries in the map.
    ///
    /// This reads an atomic counter without taking any lock, so the value
    /// is an instantaneous snapshot with no ordering relationship to any
    /// other observation of the map.
    pub fn len(&self) -> usize {
        self.len.load(ORDERING)
    }

    /// Is the map empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the current bucket count.
    ///
    /// A momentary shared hold on the table lock is taken to read the
    /// count; the value is stale the moment it is returned. Callers who
    /// need `capacity`, `split_ptr`, and `len` to agree must serialize
    /// externally.
    pub fn capacity(&self) -> usize {
        self.table.read().buckets.len()
    }

    /// Get the index of the next bucket scheduled for splitting.
    ///
    /// A snapshot in the same sense as [`capacity`](#method.capacity).
    pub fn split_ptr(&self) -> usize {
        self.table.read().split_ptr
    }

    /// Iterate over the entries in bucket order.
    ///
    /// The exclusive borrow is what makes this sound: no other operation
    /// can run while the iterator exists, so it walks the buckets without
    /// taking a single lock. Empty buckets are skipped lazily. Within a
    /// bucket, entries come out in storage order, which removals and
    /// overwrites leave unspecified.
    pub fn iter(&mut self) -> Iter<K, V> {
        Iter {
            buckets: self.table.get_mut().buckets.iter_mut(),
            entries: [].iter(),
        }
    }
}

impl<K: Hash + Eq, V> LHashMap<K, V> {
    /// Insert a key-value pair, returning the value the key mapped to
    /// before, if any.
    ///
    /// If the key is already present its value is overwritten in place:
    /// the entry count does not change and no split can be triggered. A
    /// net insertion re-checks the load factor and performs at most one
    /// split step, so a burst of insertions can leave the table
    /// transiently overloaded; it catches up on the following insertions.
    pub fn insert(&self, key: K, val: V) -> Option<V> {
        // The lock scope is deliberate: the split below must not begin
        // until both holds from this insertion are gone.
        let should_split = {
            let table = self.table.read();
            let mut entries = table.bucket_for(&key).entries.write();

            for entry in entries.iter_mut() {
                if entry.key == key {
                    return Some(mem::replace(&mut entry.val, val));
                }
            }

            entries.push(Entry { key: key, val: val });
            let len = self.len.fetch_add(1, ORDERING) + 1;

            len as f64 / table.buckets.len() as f64 > self.max_load_factor
        };

        if should_split {
            self.split();
        }

        None
    }

    /// Look up a key and lock its value for reading.
    ///
    /// Returns `None` if the key is absent. See [`ReadGuard`] for what the
    /// guard holds while it lives.
    pub fn get<Q>(&self, key: &Q) -> Option<ReadGuard<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let handle = OwningHandle::new_with_fn(self.table.read(), |table| {
            unsafe { &*table }.bucket_for(key).entries.read()
        });

        if let Ok(inner) = OwningRef::new(handle).try_map(|entries| {
            entries
                .iter()
                .find(|entry| entry.key.borrow() == key)
                .map(|entry| &entry.val)
                .ok_or(())
        }) {
            Some(ReadGuard { inner: inner })
        } else {
            None
        }
    }

    /// Look up a key and lock its value for writing.
    ///
    /// Returns `None` if the key is absent. The value can be mutated in
    /// place through the guard; the key and its bucket cannot change while
    /// the guard lives.
    pub fn get_mut<Q>(&self, key: &Q) -> Option<WriteGuard<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let handle = OwningHandle::new_with_fn(self.table.read(), |table| {
            unsafe { &*table }.bucket_for(key).entries.write()
        });

        if let Ok(inner) = OwningHandle::try_new(handle, |entries| {
            let entries = unsafe { &mut *(entries as *mut Vec<Entry<K, V>>) };
            entries
                .iter_mut()
                .find(|entry| entry.key.borrow() == key)
                .map(|entry| &mut entry.val)
                .ok_or(())
        }) {
            Some(WriteGuard { inner: inner })
        } else {
            None
        }
    }

    /// Does the map contain the given key?
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let table = self.table.read();
        let entries = table.bucket_for(key).entries.read();

        entries.iter().any(|entry| entry.key.borrow() == key)
    }

    /// Remove a key, returning the value it mapped to, if any.
    ///
    /// The victim entry is swapped with the last entry of its bucket and
    /// popped, so removal is constant time over the bucket scan. The entry
    /// count is only decremented when something was actually removed.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let table = self.table.read();
        let mut entries = table.bucket_for(key).entries.write();

        let position = entries.iter().position(|entry| entry.key.borrow() == key);

        position.map(|position| {
            let entry = entries.swap_remove(position);
            self.len.fetch_sub(1, ORDERING);
            entry.val
        })
    }

    /// Perform one split step if the map is still overloaded.
    ///
    /// Taking the table lock exclusively drains every in-flight operation,
    /// and we may have waited for a while to get it, so the load is
    /// checked again first: another thread's insertion can have split in
    /// the meantime. A missed split is fine, the next insertion over the
    /// threshold triggers it again.
    fn split(&self) {
        let mut table = self.table.write();

        if self.len.load(ORDERING) as f64 / table.buckets.len() as f64 > self.max_load_factor {
            table.split_one();
        }
    }
}

impl<K, V> Default for LHashMap<K, V> {
    fn default() -> LHashMap<K, V> {
        LHashMap::new()
    }
}

impl<K: Clone, V: Clone> Clone for LHashMap<K, V> {
    /// Clone the map bucket by bucket.
    ///
    /// The table lock is held shared for the duration, so the split state
    /// carries over to the clone unchanged and every entry lands in the
    /// bucket that addresses it. Buckets not yet visited can still take
    /// writes from other threads, so the clone is consistent per bucket,
    /// not a point-in-time snapshot of the whole map.
    fn clone(&self) -> LHashMap<K, V> {
        let table = self.table.read();
        let mut len = 0;

        let buckets = table
            .buckets
            .iter()
            .map(|bucket| {
                let entries = bucket.entries.read();
                len += entries.len();

                Box::new(Bucket::with_entries(entries.clone()))
            })
            .collect();

        LHashMap {
            len: AtomicUsize::new(len),
            max_load_factor: self.max_load_factor,
            table: RwLock::new(Table {
                buckets: buckets,
                init_size: table.init_size,
                depth: table.depth,
                split_ptr: table.split_ptr,
            }),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for LHashMap<K, V> {
    /// Dump every bucket on its own line, as `Bucket i: [k:v][k:v]`.
    ///
    /// The table lock is held exclusively for the duration, so the dump is
    /// a consistent snapshot and the bucket locks need not be taken. Do
    /// not format a map while holding a guard into it.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut table = self.table.write();

        for (index, bucket) in table.buckets.iter_mut().enumerate() {
            write!(f, "Bucket {}: ", index)?;
            for entry in bucket.entries.get_mut().iter() {
                write!(f, "[{:?}:{:?}]", entry.key, entry.val)?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

impl<K: Hash + Eq, V> FromIterator<(K, V)> for LHashMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> LHashMap<K, V> {
        let map = LHashMap::new();
        for (key, val) in iter {
            map.insert(key, val);
        }

        map
    }
}

impl<K: Hash + Eq, V> Extend<(K, V)> for LHashMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, val) in iter {
            self.insert(key, val);
        }
    }
}

/// An iterator over a quiesced map.
///
/// Yields every entry exactly once, in bucket order, skipping empty
/// buckets. Created by [`LHashMap::iter`](struct.LHashMap.html#method.iter).
pub struct Iter<'a, K: 'a, V: 'a> {
    /// The buckets not yet visited.
    buckets: slice::IterMut<'a, Box<Bucket<K, V>>>,
    /// The remaining entries of the bucket currently visited.
    entries: slice::Iter<'a, Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<(&'a K, &'a V)> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Some((&entry.key, &entry.val));
            }

            match self.buckets.next() {
                Some(bucket) => self.entries = bucket.entries.get_mut().iter(),
                None => return None,
            }
        }
    }
}

impl<'a, K, V> IntoIterator for &'a mut LHashMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

/// A consuming iterator over a map.
///
/// Yields every entry by value, in bucket order. Since the map is owned,
/// no quiescence argument and no locking is needed.
pub struct IntoIter<K, V> {
    /// The buckets not yet visited.
    buckets: vec::IntoIter<Box<Bucket<K, V>>>,
    /// The remaining entries of the bucket currently visited.
    entries: vec::IntoIter<Entry<K, V>>,
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Some((entry.key, entry.val));
            }

            match self.buckets.next() {
                Some(bucket) => self.entries = bucket.entries.into_inner().into_iter(),
                None => return None,
            }
        }
    }
}

impl<K, V> IntoIterator for LHashMap<K, V> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> IntoIter<K, V> {
        IntoIter {
            buckets: self.table.into_inner().buckets.into_iter(),
            entries: Vec::new().into_iter(),
        }
    }
}
