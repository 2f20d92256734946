//! Unordered maps over the Robin Hood engine.
//!
//! [`FlatMap`] stores `(K, V)` records inline in the bucket array;
//! [`NodeMap`] stores them behind allocator pointers, which makes
//! records address-stable across rehashes and is the configuration that
//! supports relocatable regions. Both are thin shells over the shared
//! engine and expose the same operations.
//!
//! `insert` never overwrites: the first record for a key wins until it
//! is removed. Lookups are generic over borrowed key forms
//! (`K: Borrow<Q>`), so a `String`-keyed map is queryable by `&str`.

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::ops::Index;
use core::ptr::addr_of_mut;

use crate::hash::DefaultHashBuilder;
use crate::kv::KeyValue;
use crate::region::{Global, RegionAlloc};
use crate::slot::{InlineSlot, NodeSlot, Slot};
use crate::table::{CapacityError, CoreTable, DEFAULT_MAX_LOAD_FACTOR};

/// Map with records embedded in the bucket array.
pub type FlatMap<K, V, S = DefaultHashBuilder, A = Global> = Map<K, V, InlineSlot<(K, V)>, S, A>;

/// Map with heap records referenced through allocator pointers.
pub type NodeMap<K, V, S = DefaultHashBuilder, A = Global> = Map<K, V, NodeSlot<(K, V), A>, S, A>;

/// Shared façade over the engine; use through [`FlatMap`] / [`NodeMap`].
pub struct Map<K, V, L, S = DefaultHashBuilder, A = Global>
where
    L: Slot<A, Record = (K, V)>,
    A: RegionAlloc,
{
    table: CoreTable<KeyValue<K, V>, L, S, A>,
}

impl<K, V, L, S, A> Map<K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
{
    pub fn new_in(alloc: A) -> Self
    where
        S: Default,
    {
        Map {
            table: CoreTable::new(DEFAULT_MAX_LOAD_FACTOR, S::default(), alloc),
        }
    }

    pub fn with_capacity_in(capacity: usize, alloc: A) -> Self
    where
        K: Hash,
        S: Default,
    {
        Self::with_capacity_and_hasher_in(capacity, S::default(), alloc)
    }

    pub fn with_hasher_in(hash_builder: S, alloc: A) -> Self {
        Map {
            table: CoreTable::new(DEFAULT_MAX_LOAD_FACTOR, hash_builder, alloc),
        }
    }

    pub fn with_capacity_and_hasher_in(capacity: usize, hash_builder: S, alloc: A) -> Self
    where
        K: Hash,
    {
        Map {
            table: CoreTable::with_capacity(capacity, DEFAULT_MAX_LOAD_FACTOR, hash_builder, alloc),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of buckets currently allocated.
    pub fn bucket_count(&self) -> usize {
        self.table.capacity()
    }

    pub fn load_factor(&self) -> f64 {
        self.table.load_factor()
    }

    pub fn max_load_factor(&self) -> f32 {
        self.table.max_load_factor()
    }

    /// Change the growth threshold. The value is clamped to a small
    /// positive floor and 1.0; lowering it rehashes immediately so the
    /// new bound holds.
    pub fn set_max_load_factor(&mut self, max_load_factor: f32) -> Result<(), CapacityError>
    where
        K: Hash,
    {
        self.table.set_max_load_factor(max_load_factor)
    }

    pub fn hasher(&self) -> &S {
        self.table.hasher()
    }

    pub fn allocator(&self) -> &A {
        self.table.allocator()
    }

    /// Theoretical upper bound on the number of records.
    pub fn max_size(&self) -> usize {
        self.table.max_size()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        let pos = self.table.find(key)?;
        Some(unsafe { &(*self.table.record_at(pos)).1 })
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        let pos = self.table.find(key)?;
        Some(unsafe { &mut (*self.table.record_at_mut(pos)).1 })
    }

    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        let pos = self.table.find(key)?;
        let record = unsafe { &*self.table.record_at(pos) };
        Some((&record.0, &record.1))
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        self.table.contains(key)
    }

    /// 1 when the key is present, 0 otherwise (keys are unique).
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        usize::from(self.table.contains(key))
    }

    /// Insert unless the key is present. Returns whether the record was
    /// inserted; an existing record is never overwritten.
    pub fn insert(&mut self, key: K, value: V) -> bool
    where
        K: Hash + Eq + Clone,
    {
        self.table.insert((key, value)).1
    }

    /// Insert with a lazily built value: `make` runs only when the key
    /// is absent.
    pub fn insert_with<F>(&mut self, key: K, make: F) -> bool
    where
        K: Hash + Eq + Clone,
        F: FnOnce() -> V,
    {
        self.table.insert_with(key, |k| (k, make())).1
    }

    /// Reference to the value for `key`, inserting `V::default()` first
    /// when absent (index-operator semantics).
    pub fn entry_or_default(&mut self, key: K) -> &mut V
    where
        K: Hash + Eq + Clone,
        V: Default,
    {
        let (pos, _) = self.table.insert_with(key, |k| (k, V::default()));
        unsafe { &mut (*self.table.record_at_mut(pos)).1 }
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        self.table.remove(key).map(|(_, v)| v)
    }

    pub fn remove_entry<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        self.table.remove(key)
    }

    /// Erase by key; returns the number of records removed (0 or 1).
    pub fn erase<Q>(&mut self, key: &Q) -> usize
    where
        K: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        usize::from(self.table.erase(key))
    }

    /// Drop all records, keeping the bucket array.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Keep only records for which `keep` returns true.
    ///
    /// Removal backward-shifts later records, so a record displaced
    /// across the array's wrap point can be visited again; `keep` must
    /// be consistent for repeated calls on the same record.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        K: Hash,
        F: FnMut(&K, &mut V) -> bool,
    {
        let mut pos = self.table.next_occupied(0);
        while pos < self.table.capacity() {
            let keep_it = unsafe {
                let record = &mut *self.table.record_at_mut(pos);
                keep(&record.0, &mut record.1)
            };
            if keep_it {
                pos = self.table.next_occupied(pos + 1);
            } else {
                pos = unsafe { self.table.erase_at_and_next(pos) };
            }
        }
    }

    pub fn reserve(&mut self, capacity: usize) -> Result<(), CapacityError>
    where
        K: Hash,
    {
        self.table.try_reserve(capacity)
    }

    pub fn rehash(&mut self, capacity: usize) -> Result<(), CapacityError>
    where
        K: Hash,
    {
        self.table.try_rehash(capacity)
    }

    pub fn shrink_to_fit(&mut self) -> Result<(), CapacityError>
    where
        K: Hash,
    {
        self.table.shrink_to_fit()
    }

    /// Swap contents with `other`. Allocators are swapped only when the
    /// provider propagates on swap; otherwise both maps must share a
    /// region.
    pub fn swap_with(&mut self, other: &mut Self) {
        self.table.swap_with(&mut other.table);
    }

    /// Copy this map into `alloc`'s region.
    pub fn clone_in(&self, alloc: A) -> Self
    where
        K: Clone,
        V: Clone,
        S: Clone,
    {
        Map {
            table: self.table.clone_in(alloc),
        }
    }

    /// Move this map into `alloc`'s region: steals the array when the
    /// regions match, re-inserts record by record otherwise.
    pub fn move_in(self, alloc: A) -> Self
    where
        S: Clone,
    {
        Map {
            table: self.table.move_in(alloc),
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V, L, S, A> {
        Iter {
            table: &self.table,
            pos: 0,
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, K, V, L, S, A> {
        IterMut {
            table: &mut self.table,
            pos: 0,
        }
    }

    /// `(min, mean, max)` probe distance over all records, by full scan.
    pub fn probe_distance_stats(&self) -> (usize, f64, usize)
    where
        K: Hash,
    {
        self.table.probe_distance_stats()
    }

    /// Occupied-bucket counts per stored probe distance (255 bins; the
    /// last bin aggregates saturated distances).
    pub fn probe_distance_histogram(&self) -> Vec<usize> {
        self.table.probe_distance_histogram()
    }

    /// The incrementally maintained mean probe distance estimate.
    pub fn approximate_mean_probe_distance(&self) -> f64 {
        self.table.approximate_mean_probe_distance()
    }

    /// Write an empty map at `target`, for maps that live inside an
    /// allocator region. All later growth happens in place through
    /// `&mut` access, which keeps relocatable pointer fields valid.
    ///
    /// # Safety
    /// `target` must be valid, writable, and aligned for `Self`. With a
    /// relocatable-pointer allocator the map must not be moved by value
    /// once populated.
    pub unsafe fn construct_at(target: *mut Self, hash_builder: S, alloc: A) {
        CoreTable::construct_at(
            addr_of_mut!((*target).table),
            DEFAULT_MAX_LOAD_FACTOR,
            hash_builder,
            alloc,
        );
    }

    /// Refresh the stored allocator handle after the backing region was
    /// remapped (e.g. a persistent region reopened by a new process).
    ///
    /// # Safety
    /// `alloc` must denote the same region this map's memory lives in,
    /// under its current mapping.
    pub unsafe fn reattach_allocator(&mut self, alloc: A) {
        self.table.reattach_allocator(alloc);
    }
}

impl<K, V, L, S, A> Map<K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher + Default,
    A: RegionAlloc + Default,
{
    pub fn new() -> Self {
        Self::new_in(A::default())
    }

    pub fn with_capacity(capacity: usize) -> Self
    where
        K: Hash,
    {
        Self::with_capacity_and_hasher(capacity, S::default())
    }

    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_hasher_in(hash_builder, A::default())
    }

    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self
    where
        K: Hash,
    {
        Self::with_capacity_and_hasher_in(capacity, hash_builder, A::default())
    }
}

impl<K, V, L, S, A> Default for Map<K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher + Default,
    A: RegionAlloc + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, L, S, A> Clone for Map<K, V, L, S, A>
where
    K: Clone,
    V: Clone,
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher + Clone,
    A: RegionAlloc,
{
    fn clone(&self) -> Self {
        self.clone_in(self.table.allocator().clone())
    }

    /// Reuses this map's allocator unless the provider propagates on
    /// copy assignment.
    fn clone_from(&mut self, source: &Self) {
        self.table.clone_from_impl(&source.table);
    }
}

impl<K, V, L, L2, S, A, A2> PartialEq<Map<K, V, L2, S, A2>> for Map<K, V, L, S, A>
where
    K: Hash + Eq,
    V: PartialEq,
    L: Slot<A, Record = (K, V)>,
    L2: Slot<A2, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
    A2: RegionAlloc,
{
    fn eq(&self, other: &Map<K, V, L2, S, A2>) -> bool {
        self.table.equals(&other.table)
    }
}

impl<K, V, L, S, A> Eq for Map<K, V, L, S, A>
where
    K: Hash + Eq,
    V: Eq,
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
{
}

impl<K, V, Q, L, S, A> Index<&Q> for Map<K, V, L, S, A>
where
    K: Borrow<Q> + Hash,
    Q: ?Sized + Hash + Eq,
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
{
    type Output = V;

    fn index(&self, key: &Q) -> &V {
        self.get(key).expect("key not found")
    }
}

impl<K, V, L, S, A> fmt::Debug for Map<K, V, L, S, A>
where
    K: fmt::Debug,
    V: fmt::Debug,
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, L, S, A> Extend<(K, V)> for Map<K, V, L, S, A>
where
    K: Hash + Eq + Clone,
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<K, V, L, S, A> FromIterator<(K, V)> for Map<K, V, L, S, A>
where
    K: Hash + Eq + Clone,
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher + Default,
    A: RegionAlloc + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

/// Borrowing iterator over `(&K, &V)` in unspecified order.
pub struct Iter<'a, K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    A: RegionAlloc,
{
    table: &'a CoreTable<KeyValue<K, V>, L, S, A>,
    pos: usize,
}

impl<'a, K, V, L, S, A> Iterator for Iter<'a, K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    A: RegionAlloc,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.table.next_occupied(self.pos);
        if pos >= self.table.capacity() {
            self.pos = pos;
            return None;
        }
        self.pos = pos + 1;
        let record = unsafe { &*self.table.record_at(pos) };
        Some((&record.0, &record.1))
    }
}

/// Borrowing iterator over `(&K, &mut V)` in unspecified order.
pub struct IterMut<'a, K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    A: RegionAlloc,
{
    table: &'a mut CoreTable<KeyValue<K, V>, L, S, A>,
    pos: usize,
}

impl<'a, K, V, L, S, A> Iterator for IterMut<'a, K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    A: RegionAlloc,
{
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.table.next_occupied(self.pos);
        if pos >= self.table.capacity() {
            self.pos = pos;
            return None;
        }
        self.pos = pos + 1;
        // Each position is yielded at most once, so handing out a
        // 'a-long mutable borrow per record is sound.
        let record = unsafe { &mut *self.table.record_at_mut(pos) };
        Some((&record.0, &mut record.1))
    }
}

impl<'a, K, V, L, S, A> IntoIterator for &'a Map<K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, L, S, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, L, S, A> IntoIterator for &'a mut Map<K, V, L, S, A>
where
    L: Slot<A, Record = (K, V)>,
    S: BuildHasher,
    A: RegionAlloc,
{
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V, L, S, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}
