//! The Robin Hood open-addressing engine.
//!
//! One table type drives all four public containers: records are either
//! `(K, V)` or `K` (resolved by [`EntryKind`]) and live either inline in
//! the bucket array or behind allocator pointers (resolved by the slot
//! type). Insertion steals slots from records that are closer to their
//! ideal position, deletion backward-shifts the following cluster so no
//! tombstones exist, and the table grows automatically when either the
//! load factor or an incrementally tracked mean probe distance gets too
//! high.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;
use core::mem;
use core::mem::MaybeUninit;
use core::ptr;

use crate::capacity::{CapacityPolicy, DefaultCapacity};
use crate::header::Header;
use crate::kv::EntryKind;
use crate::reentrancy::DebugReentrancy;
use crate::region::{AccessHint, RegionAlloc};
use crate::slot::Slot;
use crate::storage::Buckets;

type Cap = DefaultCapacity;

/// Errors surfaced by fallible capacity changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    /// An allocation failed. The failed reserve or rehash frees the
    /// current table and leaves the container empty.
    AllocationFailed,
    /// The request cannot be satisfied by the capacity schedule.
    CapacityExceeded,
}

pub(crate) const DEFAULT_MAX_LOAD_FACTOR: f32 = 0.875;

// Lower bound for the configurable max load factor.
const MIN_MAX_LOAD_FACTOR: f32 = f32::EPSILON * 100.0;

// The table doubles when the approximate mean probe distance exceeds
// this and the load factor is above the floor below.
const AUTO_GROW_PROBE_DISTANCE: f64 = 10.0;
const AUTO_GROW_LOAD_FACTOR_FLOOR: f64 = 0.125;

pub(crate) struct CoreTable<T, L, S, A>
where
    T: EntryKind,
    L: Slot<A, Record = T::Record>,
    A: RegionAlloc,
{
    max_load_factor: f32,
    alloc: A,
    hash_builder: S,
    mean_probe_distance: f64,
    size: usize,
    capacity_index: u8,
    buckets: Buckets<L, A>,
    reentrancy: DebugReentrancy,
    _kind: PhantomData<T>,
}

impl<T, L, S, A> CoreTable<T, L, S, A>
where
    T: EntryKind,
    L: Slot<A, Record = T::Record>,
    A: RegionAlloc,
{
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        Cap::to_capacity(self.capacity_index)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub(crate) fn load_factor(&self) -> f64 {
        if self.capacity() == 0 {
            0.0
        } else {
            self.size as f64 / self.capacity() as f64
        }
    }

    #[inline]
    pub(crate) fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    #[inline]
    pub(crate) fn allocator(&self) -> &A {
        &self.alloc
    }

    #[inline]
    pub(crate) fn hasher(&self) -> &S {
        &self.hash_builder
    }

    #[inline]
    pub(crate) fn approximate_mean_probe_distance(&self) -> f64 {
        self.mean_probe_distance
    }

    /// Theoretical upper bound on the element count.
    pub(crate) fn max_size(&self) -> usize {
        isize::MAX as usize / mem::size_of::<L>().max(1)
    }

    fn cleanse_max_load_factor(max_load_factor: f32) -> f32 {
        max_load_factor.min(1.0).max(MIN_MAX_LOAD_FACTOR)
    }

    /// First position at or after `from` whose bucket is occupied, or
    /// `capacity()` when there is none.
    pub(crate) fn next_occupied(&self, from: usize) -> usize {
        let cap = self.capacity();
        let mut pos = from;
        while pos < cap {
            if unsafe { !(*self.buckets.header(cap, pos)).is_empty() } {
                return pos;
            }
            pos += 1;
        }
        cap
    }

    /// # Safety
    /// `pos` must be an occupied bucket.
    #[inline]
    pub(crate) unsafe fn record_at(&self, pos: usize) -> *const T::Record {
        L::record(self.buckets.slot(self.capacity(), pos))
    }

    /// # Safety
    /// `pos` must be an occupied bucket.
    #[inline]
    pub(crate) unsafe fn record_at_mut(&mut self, pos: usize) -> *mut T::Record {
        L::record_mut(self.buckets.slot(self.capacity(), pos))
    }

    fn clear_all(&mut self) {
        let cap = self.capacity();
        for pos in 0..cap {
            unsafe {
                let h = self.buckets.header(cap, pos);
                if (*h).is_empty() {
                    continue;
                }
                L::clear(self.buckets.slot(cap, pos), &self.alloc);
                (*h).clear();
            }
        }
        self.size = 0;
        self.mean_probe_distance = 0.0;
    }

    /// Destroy every record and give the bucket array back.
    fn free_table(&mut self) {
        self.clear_all();
        if self.buckets.is_allocated() {
            unsafe {
                Buckets::<L, A>::deallocate_raw(&self.alloc, self.buckets.base(), self.capacity());
            }
            self.buckets.set_base(ptr::null_mut());
        }
        self.capacity_index = 0;
    }

    /// Refresh the stored allocator handle after the backing region was
    /// remapped.
    ///
    /// # Safety
    /// `alloc` must denote the same region the table's memory lives in,
    /// under its current mapping.
    pub(crate) unsafe fn reattach_allocator(&mut self, alloc: A) {
        self.alloc = alloc;
    }
}

impl<T, L, S, A> CoreTable<T, L, S, A>
where
    T: EntryKind,
    L: Slot<A, Record = T::Record>,
    S: BuildHasher,
    A: RegionAlloc,
{
    pub(crate) fn new(max_load_factor: f32, hash_builder: S, alloc: A) -> Self {
        CoreTable {
            max_load_factor: Self::cleanse_max_load_factor(max_load_factor),
            alloc,
            hash_builder,
            mean_probe_distance: 0.0,
            size: 0,
            capacity_index: 0,
            buckets: Buckets::unallocated(),
            reentrancy: DebugReentrancy::new(),
            _kind: PhantomData,
        }
    }

    pub(crate) fn with_capacity(
        capacity: usize,
        max_load_factor: f32,
        hash_builder: S,
        alloc: A,
    ) -> Self
    where
        T::Key: Hash,
    {
        let mut table = Self::new(max_load_factor, hash_builder, alloc);
        if capacity > 0 {
            table
                .reserve_impl(capacity)
                .expect("initial table allocation failed");
        }
        table
    }

    /// Write an empty table at a caller-provided address. Required for
    /// offset-pointer allocators: all pointer fields start null (which
    /// is position-independent) and every later pointer store happens in
    /// place through `&mut` access.
    ///
    /// # Safety
    /// `target` must be valid, writable, and aligned for `Self`; the
    /// written table must not be moved by value once populated if `A`
    /// uses relocatable pointers.
    pub(crate) unsafe fn construct_at(target: *mut Self, max_load_factor: f32, hash_builder: S, alloc: A) {
        target.write(Self::new(max_load_factor, hash_builder, alloc));
    }

    #[inline]
    fn hash_of<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        self.hash_builder.hash_one(key)
    }

    #[inline]
    fn ideal_pos(&self, hash: u64) -> usize {
        Cap::reduce(hash as usize, self.capacity())
    }

    #[inline]
    fn inc_pos(&self, pos: usize) -> usize {
        Cap::reduce(pos + 1, self.capacity())
    }

    #[inline]
    fn dec_pos(&self, pos: usize) -> usize {
        let cap = self.capacity();
        Cap::reduce(pos + cap - 1, cap)
    }

    /// Probe distance of the occupant of `pos`. Falls back to
    /// recomputing from the key when the stored byte is saturated.
    ///
    /// # Safety
    /// `pos` must be an occupied bucket.
    unsafe fn actual_distance(&self, pos: usize) -> usize
    where
        T::Key: Hash,
    {
        let header = *self.buckets.header(self.capacity(), pos);
        debug_assert!(!header.is_empty());
        if header.distance() < Header::max_distance() {
            return header.distance();
        }
        let ideal = self.ideal_pos(self.hash_of(T::key(&*self.record_at(pos))));
        let cap = self.capacity();
        Cap::reduce(pos + cap - ideal, cap)
    }

    /// Find `key`, or the position where it would be inserted.
    fn locate<Q>(&self, key: &Q) -> (usize, bool)
    where
        T::Key: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        let cap = self.capacity();
        if cap == 0 {
            return (0, false);
        }
        let mut pos = self.ideal_pos(self.hash_of(key));
        let mut dist = 0;
        while dist < cap {
            unsafe {
                let header = *self.buckets.header(cap, pos);
                // A richer record would have stolen this bucket, so the
                // key cannot be further along the probe path.
                if header.is_empty() || self.actual_distance(pos) < dist {
                    break;
                }
                if T::key(&*self.record_at(pos)).borrow() == key {
                    return (pos, true);
                }
            }
            pos = self.inc_pos(pos);
            dist += 1;
        }
        (pos, false)
    }

    pub(crate) fn find<Q>(&self, key: &Q) -> Option<usize>
    where
        T::Key: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let (pos, found) = self.locate(key);
        found.then_some(pos)
    }

    pub(crate) fn contains<Q>(&self, key: &Q) -> bool
    where
        T::Key: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        self.find(key).is_some()
    }

    fn enough_capacity_for(size: usize, capacity: usize, max_load_factor: f32) -> bool {
        capacity as f64 * f64::from(max_load_factor) >= size as f64
    }

    fn required_capacity(&self, size: usize) -> usize {
        let by_load = (size as f64 / f64::from(self.max_load_factor)).ceil() as usize;
        size.max(by_load)
    }

    /// Insert `record` unless its key is present. Returns the record's
    /// position and whether it was inserted.
    pub(crate) fn insert(&mut self, record: T::Record) -> (usize, bool)
    where
        T::Key: Hash + Eq + Clone,
    {
        let _g = self.reentrancy.enter();
        let (pos, found) = self.locate(T::key(&record));
        if found {
            return (pos, false);
        }
        (self.insert_core(record, Some(pos)), true)
    }

    /// Try-emplace: look the key up first and only build the record when
    /// it is absent.
    pub(crate) fn insert_with<F>(&mut self, key: T::Key, make: F) -> (usize, bool)
    where
        T::Key: Hash + Eq + Clone,
        F: FnOnce(T::Key) -> T::Record,
    {
        let _g = self.reentrancy.enter();
        let (pos, found) = self.locate(&key);
        if found {
            return (pos, false);
        }
        let record = make(key);
        (self.insert_core(record, Some(pos)), true)
    }

    fn insert_core(&mut self, record: T::Record, hint: Option<usize>) -> usize
    where
        T::Key: Hash + Eq + Clone,
    {
        let mut hint = hint;
        if self.capacity() == 0
            || !Self::enough_capacity_for(self.size + 1, self.capacity(), self.max_load_factor)
        {
            self.grow(self.size + 1).expect("automatic table growth failed");
            // Positions from before the growth no longer mean anything.
            hint = None;
        }

        unsafe {
            // The holder lives in a pinned stack slot until the probe
            // loop finds its bucket; swaps during displacement go
            // through the same slot.
            let mut carry = MaybeUninit::<L>::uninit();
            L::construct(carry.as_mut_ptr(), &self.alloc, record)
                .expect("record allocation failed");
            let inserted = self.force_insert(carry.as_mut_ptr(), hint);

            if self.mean_probe_distance > AUTO_GROW_PROBE_DISTANCE
                && self.load_factor() > AUTO_GROW_LOAD_FACTOR_FLOOR
            {
                // The record moves during the rehash; keep its key to
                // find it again.
                let key = T::key(&*self.record_at(inserted)).clone();
                self.reserve_impl(self.capacity() * 2)
                    .expect("automatic table growth failed");
                let (pos, found) = self.locate(&key);
                debug_assert!(found);
                return pos;
            }
            inserted
        }
    }

    /// Robin Hood placement without capacity or duplicate checks.
    ///
    /// # Safety
    /// `holder` must point at a live holder in storage that does not
    /// move for the duration of the call; it is vacated on return. The
    /// table must have room for one more record.
    unsafe fn force_insert(&mut self, holder: *mut L, hint: Option<usize>) -> usize
    where
        T::Key: Hash,
    {
        let cap = self.capacity();
        debug_assert!(cap > 0);

        let (mut pos, mut dist) = match hint {
            Some(p) => {
                let ideal = self.ideal_pos(self.hash_of(T::key(&*L::record(holder))));
                (p, Cap::reduce(p + cap - ideal, cap))
            }
            None => (self.ideal_pos(self.hash_of(T::key(&*L::record(holder)))), 0),
        };

        let mut inserted_pos = None;
        while dist < cap {
            let header_ptr = self.buckets.header(cap, pos);
            if (*header_ptr).is_empty() {
                (*header_ptr).set_distance(dist);
                self.mean_probe_distance = (self.mean_probe_distance * self.size as f64
                    + dist as f64)
                    / (self.size + 1) as f64;
                L::move_into(self.buckets.slot(cap, pos), holder);
                self.size += 1;
                return inserted_pos.unwrap_or(pos);
            }

            let existing = self.actual_distance(pos);
            if existing < dist {
                // Steal: the incumbent is closer to home than we are.
                L::swap(self.buckets.slot(cap, pos), holder);
                (*header_ptr).set_distance(dist);
                self.mean_probe_distance = (self.mean_probe_distance * self.size as f64
                    - existing as f64
                    + dist as f64)
                    / self.size as f64;
                dist = existing;
                if inserted_pos.is_none() {
                    inserted_pos = Some(pos);
                }
            }
            pos = self.inc_pos(pos);
            dist += 1;
        }
        unreachable!("probe loop cycled a table that should have a free bucket");
    }

    /// Backward shift: close the gap at `pos` by pulling the following
    /// cluster one bucket back until an empty bucket or a record that is
    /// already home.
    ///
    /// # Safety
    /// The record at `pos` must already be destroyed or moved out; its
    /// header must still be marked occupied.
    unsafe fn shift_back(&mut self, pos: usize)
    where
        T::Key: Hash,
    {
        let cap = self.capacity();
        let mut i = self.inc_pos(pos);
        let mut steps = 0;
        loop {
            let header = *self.buckets.header(cap, i);
            if header.is_empty() {
                break;
            }
            let pd = self.actual_distance(i);
            if pd == 0 {
                break;
            }
            let prev = self.dec_pos(i);
            L::move_into(self.buckets.slot(cap, prev), self.buckets.slot(cap, i));
            (*self.buckets.header(cap, prev)).set_distance(pd - 1);
            self.mean_probe_distance = (self.mean_probe_distance * self.size as f64 - pd as f64
                + (pd - 1) as f64)
                / self.size as f64;
            i = self.inc_pos(i);
            steps += 1;
            if steps >= cap {
                unreachable!("backward shift cycled the table");
            }
        }
        (*self.buckets.header(cap, self.dec_pos(i))).clear();
        self.size -= 1;
    }

    /// # Safety
    /// `pos` must be an occupied bucket.
    pub(crate) unsafe fn erase_at(&mut self, pos: usize)
    where
        T::Key: Hash,
    {
        L::clear(self.buckets.slot(self.capacity(), pos), &self.alloc);
        self.shift_back(pos);
    }

    /// Erase `pos` and return the next occupied position at or after it
    /// (which may hold a record just shifted into `pos`), or
    /// `capacity()` when the tail of the array is empty.
    ///
    /// # Safety
    /// `pos` must be an occupied bucket.
    pub(crate) unsafe fn erase_at_and_next(&mut self, pos: usize) -> usize
    where
        T::Key: Hash,
    {
        self.erase_at(pos);
        self.next_occupied(pos)
    }

    pub(crate) fn erase<Q>(&mut self, key: &Q) -> bool
    where
        T::Key: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let (pos, found) = self.locate(key);
        if !found {
            return false;
        }
        unsafe { self.erase_at(pos) };
        true
    }

    /// Erase by key, handing the record back instead of dropping it.
    pub(crate) fn remove<Q>(&mut self, key: &Q) -> Option<T::Record>
    where
        T::Key: Borrow<Q> + Hash,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let (pos, found) = self.locate(key);
        if !found {
            return None;
        }
        unsafe {
            let record = L::take(self.buckets.slot(self.capacity(), pos), &self.alloc);
            self.shift_back(pos);
            Some(record)
        }
    }

    pub(crate) fn clear(&mut self) {
        let _g = self.reentrancy.enter();
        self.clear_all();
    }

    pub(crate) fn try_reserve(&mut self, capacity: usize) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        let _g = self.reentrancy.enter();
        self.reserve_impl(capacity)
    }

    pub(crate) fn try_rehash(&mut self, capacity: usize) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        let _g = self.reentrancy.enter();
        self.rehash_impl(capacity)
    }

    pub(crate) fn shrink_to_fit(&mut self) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        let _g = self.reentrancy.enter();
        self.rehash_impl(self.size)
    }

    pub(crate) fn set_max_load_factor(&mut self, max_load_factor: f32) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        let _g = self.reentrancy.enter();
        let old = self.max_load_factor;
        self.max_load_factor = Self::cleanse_max_load_factor(max_load_factor);
        if self.max_load_factor < old {
            self.rehash_impl(self.capacity())?;
        }
        Ok(())
    }

    fn reserve_impl(&mut self, capacity: usize) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        if capacity <= self.capacity() {
            return Ok(());
        }
        let new_capacity = Cap::adjust(capacity);
        if new_capacity < capacity {
            return Err(CapacityError::CapacityExceeded);
        }
        self.transfer_to(new_capacity)
    }

    fn rehash_impl(&mut self, capacity: usize) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        let target = capacity.max(self.required_capacity(self.size));
        let new_capacity = Cap::adjust(target);
        if new_capacity < target {
            return Err(CapacityError::CapacityExceeded);
        }
        self.transfer_to(new_capacity)
    }

    /// Grow to the next schedule step that fits `min_size`.
    fn grow(&mut self, min_size: usize) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        let mut index = self.capacity_index + 1;
        loop {
            let capacity = Cap::to_capacity(index);
            if Self::enough_capacity_for(min_size, capacity, self.max_load_factor) {
                break;
            }
            if capacity >= Cap::max_capacity() {
                return Err(CapacityError::CapacityExceeded);
            }
            index += 1;
        }
        self.reserve_impl(Cap::to_capacity(index))
    }

    /// Move every record into a freshly allocated array of
    /// `new_capacity` buckets.
    ///
    /// On allocation failure the current table is freed and the
    /// container is left empty; partial transfers never escape.
    fn transfer_to(&mut self, new_capacity: usize) -> Result<(), CapacityError>
    where
        T::Key: Hash,
    {
        debug_assert_eq!(new_capacity, Cap::adjust(new_capacity));
        if new_capacity == 0 {
            self.free_table();
            return Ok(());
        }

        let new_base = match Buckets::<L, A>::allocate_raw(&self.alloc, new_capacity) {
            Ok(base) => base,
            Err(_) => {
                self.free_table();
                return Err(CapacityError::AllocationFailed);
            }
        };

        let old_capacity = self.capacity();
        let old_base = self.buckets.base();
        self.buckets.set_base(new_base);
        self.capacity_index = Cap::to_index(new_capacity);
        self.size = 0;
        self.mean_probe_distance = 0.0;

        self.alloc.advise(
            new_base,
            Buckets::<L, A>::memory_size(new_capacity),
            AccessHint::Random,
        );
        if old_capacity == 0 {
            return Ok(());
        }
        self.alloc.advise(
            old_base,
            Buckets::<L, A>::memory_size(old_capacity),
            AccessHint::Sequential,
        );

        unsafe {
            let mut carry = MaybeUninit::<L>::uninit();
            for pos in 0..old_capacity {
                let header = Buckets::<L, A>::header_at(old_base, old_capacity, pos);
                if (*header).is_empty() {
                    continue;
                }
                L::move_into(
                    carry.as_mut_ptr(),
                    Buckets::<L, A>::slot_at(old_base, old_capacity, pos),
                );
                (*header).clear();
                // The new capacity is known to suffice; no checks.
                self.force_insert(carry.as_mut_ptr(), None);
            }
            Buckets::<L, A>::deallocate_raw(&self.alloc, old_base, old_capacity);
        }
        Ok(())
    }

    /// Structural equality: same size, and every record of `self` has an
    /// equal-keyed, equal-valued record in `other`. Layouts and
    /// allocators may differ.
    pub(crate) fn equals<L2, A2>(&self, other: &CoreTable<T, L2, S, A2>) -> bool
    where
        T::Key: Hash + Eq,
        T::Record: PartialEq,
        L2: Slot<A2, Record = T::Record>,
        A2: RegionAlloc,
    {
        let _g = self.reentrancy.enter();
        if self.size != other.size {
            return false;
        }
        let cap = self.capacity();
        for pos in 0..cap {
            unsafe {
                if (*self.buckets.header(cap, pos)).is_empty() {
                    continue;
                }
                let record = &*self.record_at(pos);
                let (other_pos, found) = other.locate(T::key(record));
                if !found || *record != *other.record_at(other_pos) {
                    return false;
                }
            }
        }
        true
    }

    /// `(min, mean, max)` of actual probe distances, by full scan.
    pub(crate) fn probe_distance_stats(&self) -> (usize, f64, usize)
    where
        T::Key: Hash,
    {
        let _g = self.reentrancy.enter();
        if self.size == 0 {
            return (0, 0.0, 0);
        }
        let cap = self.capacity();
        let mut min = usize::MAX;
        let mut max = 0usize;
        let mut sum = 0usize;
        for pos in 0..cap {
            unsafe {
                if (*self.buckets.header(cap, pos)).is_empty() {
                    continue;
                }
                let pd = self.actual_distance(pos);
                min = min.min(pd);
                max = max.max(pd);
                sum += pd;
            }
        }
        (min, sum as f64 / self.size as f64, max)
    }

    /// Occupied-bucket counts by stored (saturating) distance; the last
    /// bin aggregates everything at or past the saturation point.
    pub(crate) fn probe_distance_histogram(&self) -> Vec<usize> {
        let _g = self.reentrancy.enter();
        let cap = self.capacity();
        let mut histogram = vec![0usize; Header::max_distance() + 1];
        for pos in 0..cap {
            unsafe {
                let header = *self.buckets.header(cap, pos);
                if !header.is_empty() {
                    histogram[header.distance()] += 1;
                }
            }
        }
        histogram
    }

    /// Copy-construct into a (possibly different) region.
    pub(crate) fn clone_in(&self, alloc: A) -> Self
    where
        T::Record: Clone,
        S: Clone,
    {
        let mut new = Self::new(self.max_load_factor, self.hash_builder.clone(), alloc);
        new.copy_entries_from(self);
        new
    }

    /// Positional copy of headers and records, preserving capacity and
    /// the mean-probe estimate.
    fn copy_entries_from(&mut self, source: &Self)
    where
        T::Record: Clone,
    {
        debug_assert!(self.size == 0 && self.capacity() == 0);
        self.mean_probe_distance = source.mean_probe_distance;
        let cap = source.capacity();
        if cap == 0 {
            return;
        }
        let base =
            Buckets::<L, A>::allocate_raw(&self.alloc, cap).expect("table allocation failed");
        self.buckets.set_base(base);
        self.capacity_index = source.capacity_index;
        unsafe {
            for pos in 0..cap {
                let sh = *source.buckets.header(cap, pos);
                if sh.is_empty() {
                    continue;
                }
                let record = (*source.record_at(pos)).clone();
                L::construct(self.buckets.slot(cap, pos), &self.alloc, record)
                    .expect("record allocation failed");
                *self.buckets.header(cap, pos) = sh;
                self.size += 1;
            }
        }
    }

    /// Positional move of records out of `source`, constructing fresh
    /// holders with this table's allocator. `source` ends empty.
    fn move_entries_from(&mut self, source: &mut Self) {
        debug_assert!(self.size == 0 && self.capacity() == 0);
        self.mean_probe_distance = source.mean_probe_distance;
        let cap = source.capacity();
        if cap == 0 {
            return;
        }
        let base =
            Buckets::<L, A>::allocate_raw(&self.alloc, cap).expect("table allocation failed");
        self.buckets.set_base(base);
        self.capacity_index = source.capacity_index;
        unsafe {
            for pos in 0..cap {
                let sh = *source.buckets.header(cap, pos);
                if sh.is_empty() {
                    continue;
                }
                let record = L::take(source.buckets.slot(cap, pos), &source.alloc);
                (*source.buckets.header(cap, pos)).clear();
                source.size -= 1;
                L::construct(self.buckets.slot(cap, pos), &self.alloc, record)
                    .expect("record allocation failed");
                *self.buckets.header(cap, pos) = sh;
                self.size += 1;
            }
        }
        source.free_table();
    }

    /// Move into `alloc`'s region: steal the array when the regions
    /// match, otherwise re-insert records one by one.
    pub(crate) fn move_in(mut self, alloc: A) -> Self
    where
        S: Clone,
    {
        if alloc.same_region(&self.alloc) {
            self.alloc = alloc;
            return self;
        }
        let mut new = Self::new(self.max_load_factor, self.hash_builder.clone(), alloc);
        new.move_entries_from(&mut self);
        new
    }

    /// Swap contents; allocators swap only when the provider opts in.
    pub(crate) fn swap_with(&mut self, other: &mut Self) {
        let _g = self.reentrancy.enter();
        if A::PROPAGATE_ON_SWAP {
            mem::swap(&mut self.alloc, &mut other.alloc);
        } else {
            debug_assert!(
                self.alloc.same_region(&other.alloc),
                "swap of tables backed by different regions"
            );
        }
        mem::swap(&mut self.max_load_factor, &mut other.max_load_factor);
        mem::swap(&mut self.hash_builder, &mut other.hash_builder);
        mem::swap(&mut self.mean_probe_distance, &mut other.mean_probe_distance);
        mem::swap(&mut self.size, &mut other.size);
        mem::swap(&mut self.capacity_index, &mut other.capacity_index);
        let a = self.buckets.base();
        let b = other.buckets.base();
        self.buckets.set_base(b);
        other.buckets.set_base(a);
    }

    /// `clone_from` body shared by the façades; honors the provider's
    /// copy-propagation choice.
    pub(crate) fn clone_from_impl(&mut self, source: &Self)
    where
        T::Record: Clone,
        S: Clone,
    {
        self.free_table();
        self.max_load_factor = source.max_load_factor;
        self.hash_builder = source.hash_builder.clone();
        if A::PROPAGATE_ON_CLONE_FROM {
            self.alloc = source.alloc.clone();
        }
        self.copy_entries_from(source);
    }
}

impl<T, L, S, A> Drop for CoreTable<T, L, S, A>
where
    T: EntryKind,
    L: Slot<A, Record = T::Record>,
    A: RegionAlloc,
{
    fn drop(&mut self) {
        self.free_table();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{seeded_hash_builder, DefaultHashBuilder};
    use crate::kv::{KeyOnly, KeyValue};
    use crate::region::{Arena, Global};
    use crate::slot::{InlineSlot, NodeSlot};

    type FlatU64 = CoreTable<KeyValue<u64, u64>, InlineSlot<(u64, u64)>, DefaultHashBuilder, Global>;
    type NodeU64 =
        CoreTable<KeyValue<u64, u64>, NodeSlot<(u64, u64), Global>, DefaultHashBuilder, Global>;

    fn flat() -> FlatU64 {
        FlatU64::new(DEFAULT_MAX_LOAD_FACTOR, seeded_hash_builder(7), Global)
    }

    fn node() -> NodeU64 {
        NodeU64::new(DEFAULT_MAX_LOAD_FACTOR, seeded_hash_builder(7), Global)
    }

    /// Full-scan invariant check: every occupied bucket's distance
    /// matches its key's ideal position, every key is reachable through
    /// locate, and the size respects the load-factor bound.
    fn assert_invariants(t: &FlatU64) {
        let cap = t.capacity();
        let mut seen = 0;
        for pos in 0..cap {
            if t.next_occupied(pos) != pos {
                continue;
            }
            seen += 1;
            unsafe {
                let record = &*t.record_at(pos);
                let ideal = t.ideal_pos(t.hash_of(&record.0));
                let expect = Cap::reduce(pos + cap - ideal, cap);
                assert_eq!(t.actual_distance(pos), expect);
                let (found_pos, found) = t.locate(&record.0);
                assert!(found);
                assert_eq!(found_pos, pos);
            }
        }
        assert_eq!(seen, t.len());
        assert!(
            t.len() as f64 <= f64::from(t.max_load_factor()) * cap as f64 || cap == 0
        );
    }

    /// Invariant: inserting into a capacity-0 table grows it, and basic
    /// find/erase behave.
    #[test]
    fn insert_find_erase_from_empty() {
        let mut t = flat();
        assert_eq!(t.capacity(), 0);
        assert_eq!(t.find(&1u64), None);

        for k in 1..=4u64 {
            let (_, inserted) = t.insert((k, 10 * k + k));
            assert!(inserted);
        }
        assert_eq!(t.len(), 4);
        for k in 1..=4u64 {
            let pos = t.find(&k).expect("present");
            assert_eq!(unsafe { (*t.record_at(pos)).1 }, 10 * k + k);
        }
        assert_invariants(&t);

        assert!(t.erase(&2u64));
        assert!(!t.erase(&2u64));
        assert_eq!(t.len(), 3);
        assert_invariants(&t);
    }

    /// Invariant: a duplicate insert neither overwrites nor changes the
    /// size (first-writer-wins).
    #[test]
    fn duplicate_insert_does_not_overwrite() {
        let mut t = flat();
        assert!(t.insert((5, 50)).1);
        let (pos, inserted) = t.insert((5, 99));
        assert!(!inserted);
        assert_eq!(unsafe { (*t.record_at(pos)).1 }, 50);
        assert_eq!(t.len(), 1);

        // insert_with must not even build the record for a present key.
        let (_, inserted) = t.insert_with(5, |_| panic!("value built for a present key"));
        assert!(!inserted);
    }

    /// Invariant: the backward-shift erase preserves probe-distance
    /// invariants across a churning workload.
    #[test]
    fn churn_preserves_invariants() {
        let mut t = flat();
        for k in 0..512u64 {
            t.insert((k, k));
        }
        for k in (0..512u64).step_by(3) {
            assert!(t.erase(&k));
        }
        assert_invariants(&t);
        for k in 1000..1200u64 {
            t.insert((k, k));
        }
        assert_invariants(&t);
        for k in 0..512u64 {
            assert_eq!(t.find(&k).is_some(), k % 3 != 0, "key {k}");
        }
    }

    /// All keys land on one ideal position: distances blow past the
    /// one-byte limit and must be recomputed from the key. The auto-grow
    /// trigger also fires here (mean far above 10 while the load factor
    /// is above 1/8) until the table out-spreads it.
    #[test]
    fn saturated_distances_recompute() {
        #[derive(Clone, Default)]
        struct ConstBuildHasher;
        struct ConstHasher;
        impl BuildHasher for ConstBuildHasher {
            type Hasher = ConstHasher;
            fn build_hasher(&self) -> Self::Hasher {
                ConstHasher
            }
        }
        impl core::hash::Hasher for ConstHasher {
            fn write(&mut self, _bytes: &[u8]) {}
            fn finish(&self) -> u64 {
                0
            }
        }

        let mut t: CoreTable<KeyValue<u64, u64>, InlineSlot<(u64, u64)>, ConstBuildHasher, Global> =
            CoreTable::new(DEFAULT_MAX_LOAD_FACTOR, ConstBuildHasher, Global);
        let n = 300u64;
        for k in 0..n {
            t.insert((k, k + 1));
        }
        assert_eq!(t.len(), n as usize);
        for k in 0..n {
            let pos = t.find(&k).expect("collided key still reachable");
            assert_eq!(unsafe { (*t.record_at(pos)).1 }, k + 1);
        }
        let (_, _, max) = t.probe_distance_stats();
        assert!(max >= n as usize - 1, "one giant cluster, max was {max}");
        assert!(max > Header::max_distance());

        // The histogram's saturation bin holds everything at or past it.
        let hist = t.probe_distance_histogram();
        let saturated = (n as usize).saturating_sub(Header::max_distance());
        assert_eq!(hist[Header::max_distance()], saturated);
        assert_eq!(hist.iter().sum::<usize>(), n as usize);

        for k in 0..n {
            assert!(t.erase(&k));
        }
        assert_eq!(t.len(), 0);
    }

    /// Invariant: a key whose ideal position is the last bucket probes
    /// into bucket 0. (Pins ideal positions through the power-of-two
    /// mask, so it only runs under the default schedule.)
    #[cfg(not(feature = "prime-capacity"))]
    #[test]
    fn probe_wraps_around() {
        #[derive(Clone)]
        struct LastBucket;
        struct LastBucketHasher(u64);
        impl BuildHasher for LastBucket {
            type Hasher = LastBucketHasher;
            fn build_hasher(&self) -> Self::Hasher {
                LastBucketHasher(0)
            }
        }
        impl core::hash::Hasher for LastBucketHasher {
            fn write(&mut self, bytes: &[u8]) {
                for &b in bytes {
                    self.0 = self.0.wrapping_mul(31).wrapping_add(u64::from(b));
                }
            }
            fn finish(&self) -> u64 {
                // Everything lands on capacity - 1 for any power-of-two
                // capacity up to 2^6 (and harmlessly elsewhere beyond).
                63
            }
        }

        let mut t: CoreTable<KeyValue<u64, u64>, InlineSlot<(u64, u64)>, LastBucket, Global> =
            CoreTable::with_capacity(8, DEFAULT_MAX_LOAD_FACTOR, LastBucket, Global);
        let cap = t.capacity();
        t.insert((1, 1));
        t.insert((2, 2));
        assert_eq!(t.find(&1).unwrap(), cap - 1);
        assert_eq!(t.find(&2).unwrap(), 0, "second collider wraps to bucket 0");
        assert!(t.erase(&1));
        // Backward shift pulls the wrapped record home.
        assert_eq!(t.find(&2).unwrap(), cap - 1);
    }

    /// Invariant: reserve rounds up to the schedule, never shrinks, and
    /// is a no-op for smaller requests (scenario: reserve 100 / insert /
    /// reserve 1).
    #[test]
    fn reserve_ladder() {
        let mut t = flat();
        t.try_reserve(100).unwrap();
        let cap = t.capacity();
        assert!(cap >= 100);
        t.insert((0, 0));
        t.insert((1, 1));
        assert_eq!(t.capacity(), cap);
        t.try_reserve(1).unwrap();
        assert_eq!(t.capacity(), cap);
    }

    /// Invariant: rehash/shrink keep all records; shrink_to_fit on an
    /// emptied table returns it to capacity 0.
    #[test]
    fn rehash_and_shrink() {
        let mut t = node();
        for k in 0..100u64 {
            t.insert((k, k));
        }
        t.try_reserve(10_000).unwrap();
        assert!(t.capacity() >= 10_000);
        t.shrink_to_fit().unwrap();
        assert!(t.capacity() < 10_000);
        for k in 0..100u64 {
            assert!(t.contains(&k));
        }

        for k in 0..100u64 {
            assert!(t.erase(&k));
        }
        t.shrink_to_fit().unwrap();
        assert_eq!(t.capacity(), 0);
        assert_eq!(t.len(), 0);
    }

    /// Q1 policy: an allocation failure during reserve frees the table
    /// and leaves the container empty, with the error reported.
    #[test]
    fn failed_reserve_empties_table() {
        let arena = Arena::with_capacity(4096);
        let mut t: CoreTable<
            KeyValue<u64, u64>,
            NodeSlot<(u64, u64), crate::region::ArenaRef>,
            DefaultHashBuilder,
            crate::region::ArenaRef,
        > = CoreTable::new(DEFAULT_MAX_LOAD_FACTOR, seeded_hash_builder(1), arena.handle());
        for k in 0..8u64 {
            t.insert((k, k));
        }
        assert_eq!(t.len(), 8);

        let err = t.try_reserve(1 << 16).unwrap_err();
        assert_eq!(err, CapacityError::AllocationFailed);
        assert_eq!(t.len(), 0);
        assert_eq!(t.capacity(), 0);
        // The table is still usable afterwards.
        t.insert((1, 1));
        assert!(t.contains(&1u64));
    }

    /// Invariant: requests past the schedule maximum report
    /// CapacityExceeded without touching the table.
    #[test]
    fn capacity_exceeded_is_reported() {
        let mut t = flat();
        t.insert((1, 1));
        let err = t.try_reserve(usize::MAX).unwrap_err();
        assert_eq!(err, CapacityError::CapacityExceeded);
        assert!(t.contains(&1u64));
        assert_eq!(t.len(), 1);
    }

    /// Invariant: the incremental mean tracks the true mean closely
    /// enough to drive the rehash trigger.
    #[test]
    fn approximate_mean_tracks_scan_mean() {
        let mut t = flat();
        for k in 0..2000u64 {
            t.insert((k.wrapping_mul(0x9e37_79b9_7f4a_7c15), k));
        }
        for k in (0..2000u64).step_by(2) {
            t.erase(&k.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        }
        let (_, scan_mean, _) = t.probe_distance_stats();
        let approx = t.approximate_mean_probe_distance();
        assert!(
            (scan_mean - approx).abs() <= 1.0,
            "scan {scan_mean} vs approx {approx}"
        );
    }

    /// Invariant: erase_at_and_next returns the position that now holds
    /// the next record (possibly the shifted successor) or capacity when
    /// the tail is empty.
    #[test]
    fn erase_and_advance() {
        let mut t = flat();
        for k in 0..32u64 {
            t.insert((k, k));
        }
        let mut remaining = t.len();
        let mut pos = t.next_occupied(0);
        while pos < t.capacity() {
            pos = unsafe { t.erase_at_and_next(pos) };
            remaining -= 1;
            pos = t.next_occupied(pos);
        }
        // A linear erase-advance sweep visits every record exactly once:
        // backward shifts only move records toward lower positions.
        assert_eq!(remaining, 0);
        assert_eq!(t.len(), 0);
    }

    /// Invariant: structural equality ignores layout and capacity,
    /// compares full records, and detects value differences.
    #[test]
    fn equality_across_layouts() {
        let mut a = flat();
        let mut b = node();
        for k in 0..50u64 {
            a.insert((k, k * 2));
            b.insert((k, k * 2));
        }
        b.try_reserve(4096).unwrap();
        assert!(a.equals(&b));
        assert!(b.equals(&a));

        b.erase(&49u64);
        assert!(!a.equals(&b));
        b.insert((49, 0));
        assert_eq!(a.len(), b.len());
        assert!(!a.equals(&b), "same keys, different value");
    }

    /// Invariant: clone_in copies records and preserves equality; the
    /// clone is independent.
    #[test]
    fn clone_is_independent() {
        let mut a = node();
        for k in 0..20u64 {
            a.insert((k, k));
        }
        let mut b = a.clone_in(Global);
        assert!(a.equals(&b));
        b.erase(&3u64);
        assert!(!a.equals(&b));
        assert!(a.contains(&3u64));
    }

    /// Invariant: move_in across equal regions steals the table; records
    /// survive either way.
    #[test]
    fn move_in_preserves_records() {
        let mut a = flat();
        for k in 0..20u64 {
            a.insert((k, k));
        }
        let b = a.move_in(Global);
        assert_eq!(b.len(), 20);
        for k in 0..20u64 {
            assert!(b.contains(&k));
        }
    }

    /// Invariant: swap exchanges contents completely.
    #[test]
    fn swap_exchanges_contents() {
        let mut a = flat();
        let mut b = flat();
        a.insert((1, 10));
        b.insert((2, 20));
        b.insert((3, 30));
        a.swap_with(&mut b);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(a.contains(&2u64) && a.contains(&3u64));
        assert!(b.contains(&1u64));
    }

    /// Invariant: sets (bare-key records) run through the same engine.
    #[test]
    fn key_only_records() {
        let mut t: CoreTable<KeyOnly<String>, InlineSlot<String>, DefaultHashBuilder, Global> =
            CoreTable::new(DEFAULT_MAX_LOAD_FACTOR, DefaultHashBuilder::default(), Global);
        assert!(t.insert("a".to_string()).1);
        assert!(!t.insert("a".to_string()).1);
        // Borrowed lookup through &str.
        assert!(t.contains("a"));
        assert!(!t.contains("b"));
        assert_eq!(t.remove("a"), Some("a".to_string()));
        assert_eq!(t.len(), 0);
    }
}
