use std::alloc::Layout;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::iter::FusedIterator;
use std::mem::{self, size_of};
use std::num::NonZero;
use std::ops::Range;
use std::ptr;
use std::slice;

use bytemuck::{AnyBitPattern, NoUninit};
use foldhash::fast::FixedState;
use tracing::{debug, trace};

use crate::{
    AsByteSpan, BlockAllocator, BufferHeader, ByteSpan, Error, Global, RawHashTableBuilder,
    RawList, Result,
};

/// Link value that terminates a bucket chain or the free list.
const NO_SLOT: usize = usize::MAX;

/// A separately chained hash table over fixed-size `Copy` keys, with an optional fixed-size
/// value record per slot and a free list for slot reuse.
///
/// Every entry lives in a slot identified by a slot id in `[0, capacity)`. Slots are handed out
/// from the free list first (most recently freed slot first) and otherwise from the allocation
/// high-water mark. Removal returns the slot to the free list without clearing its key or value
/// record.
///
/// One link array serves two purposes: for an occupied slot it links to the next slot in the
/// same bucket chain, for a free slot it links to the next free slot. A slot is in exactly one
/// of those lists at any time.
///
/// Value records are opaque byte records whose size is fixed when the table is built. They are
/// read and written by slot id through [`get_value()`][Self::get_value] and
/// [`set_value()`][Self::set_value], using any type of exactly the record size.
///
/// # Capacity
///
/// The `_no_resize` operations never allocate and fail when no slot is available. The growth
/// operations ([`add()`][Self::add], [`try_add()`][Self::try_add],
/// [`ensure_capacity()`][Self::ensure_capacity], [`resize()`][Self::resize]) grow the slot
/// capacity to a power of two. The bucket count is kept at `capacity * buckets_per_slot`
/// rounded up to a power of two and every chain is rebuilt when it grows.
///
/// # Examples
///
/// ```
/// use raw_collections::RawHashTable;
///
/// let mut table = RawHashTable::<u64>::builder()
///     .capacity(16)
///     .value_of::<u32>()
///     .build()?;
///
/// let slot = table.add_unchecked_no_resize_with_value(42, 7_u32)?;
///
/// assert_eq!(table.find(&42), Some(slot));
/// assert_eq!(table.get_value::<u32>(slot)?, 7);
///
/// assert!(table.remove(&42));
/// assert_eq!(table.find(&42), None);
/// # Ok::<(), raw_collections::Error>(())
/// ```
///
/// # Thread safety
///
/// The table is thread-mobile ([`Send`]) if its keys, hasher and allocator are, but it is not
/// thread-safe ([`Sync`]).
pub struct RawHashTable<K, S = FixedState, A = Global>
where
    K: Copy + Eq + Hash,
    S: BuildHasher,
    A: BlockAllocator + Clone,
{
    /// Key of every allocated slot. The length is the allocation high-water mark.
    keys: RawList<K, A>,

    /// Chain link of every allocated slot. Same length as `keys`.
    next: RawList<usize, A>,

    /// Value record of every allocated slot, `None` if records are zero-sized.
    values: Option<BufferHeader<A>>,

    /// Chain head of every bucket. The length is the bucket capacity, always a power of two.
    buckets: RawList<usize, A>,

    /// Head of the free list.
    first_free: Option<usize>,

    /// Number of occupied slots.
    count: usize,

    /// Number of slots that can be handed out. Every slot array can hold at least this many.
    capacity: usize,

    buckets_per_slot: NonZero<usize>,
    value_layout: Layout,
    hasher: S,
    allocator: A,
}

impl<K> RawHashTable<K>
where
    K: Copy + Eq + Hash,
{
    /// Starts building a table with the default hasher and the global allocator.
    ///
    /// # Examples
    ///
    /// ```
    /// use raw_collections::RawHashTable;
    ///
    /// let table = RawHashTable::<u32>::builder().capacity(100).build()?;
    ///
    /// assert_eq!(table.capacity(), 128);
    /// # Ok::<(), raw_collections::Error>(())
    /// ```
    pub fn builder() -> RawHashTableBuilder<K> {
        RawHashTableBuilder::new()
    }

    /// Creates a table without value records that can hold at least `capacity` keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial allocation fails.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::builder().capacity(capacity).build()
    }
}

impl<K, S, A> RawHashTable<K, S, A>
where
    K: Copy + Eq + Hash,
    S: BuildHasher,
    A: BlockAllocator + Clone,
{
    pub(crate) fn new_inner(
        capacity: usize,
        value_layout: Layout,
        buckets_per_slot: NonZero<usize>,
        hasher: S,
        allocator: A,
    ) -> Result<Self> {
        let value_layout = value_layout.pad_to_align();

        let values = (value_layout.size() > 0)
            .then(|| BufferHeader::new_in(value_layout, allocator.clone()));

        let mut table = Self {
            keys: RawList::new_in(allocator.clone()),
            next: RawList::new_in(allocator.clone()),
            values,
            buckets: empty_buckets(1, allocator.clone())?,
            first_free: None,
            count: 0,
            capacity: 0,
            buckets_per_slot,
            value_layout,
            hasher,
            allocator,
        };

        table.resize(capacity)?;

        Ok(table)
    }

    /// Number of occupied slots.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no slot is occupied.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots that can be handed out without growing.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One past the highest slot id ever handed out.
    #[must_use]
    #[inline]
    pub fn allocated_index(&self) -> usize {
        self.keys.len()
    }

    /// Number of buckets. Always a power of two.
    #[must_use]
    #[inline]
    pub fn bucket_capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Layout of one value record. Zero-sized if the table has no value records.
    #[must_use]
    #[inline]
    pub fn value_layout(&self) -> Layout {
        self.value_layout
    }

    /// The hasher used to assign keys to buckets.
    #[must_use]
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// The bucket that `key` belongs to.
    #[must_use]
    #[inline]
    pub fn bucket_index(&self, key: &K) -> usize {
        self.bucket_for_hash(self.hasher.hash_one(key))
    }

    /// Returns the slot id holding `key`, if any.
    #[must_use]
    pub fn find(&self, key: &K) -> Option<usize> {
        let bucket = self.bucket_index(key);

        SlotChain::new(self.next.as_slice(), self.bucket_head(bucket))
            .find(|slot| self.key_of(*slot) == key)
    }

    /// Whether any slot holds `key`.
    #[must_use]
    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts `key` into a free slot without checking whether it is already present.
    ///
    /// If the key is already present, the table ends up with two slots holding it and
    /// [`find()`][Self::find] returns the newer one until it is removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if no slot is available. The table is unchanged in
    /// that case.
    pub fn add_unchecked_no_resize(&mut self, key: K) -> Result<usize> {
        let slot = self.take_slot(key)?;
        self.link(slot, key);

        #[cfg(any(debug_assertions, feature = "integrity_checks"))]
        self.integrity_check();

        Ok(slot)
    }

    /// Inserts `key` with a value record without checking whether it is already present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueSizeMismatch`] if `V` does not have the record size and
    /// [`Error::SlotOutOfRange`] if no slot is available. The table is unchanged on error.
    pub fn add_unchecked_no_resize_with_value<V: NoUninit>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<usize> {
        self.check_value_size::<V>()?;

        let slot = self.add_unchecked_no_resize(key)?;
        self.write_value(slot, bytemuck::bytes_of(&value));

        Ok(slot)
    }

    /// Inserts `key` into a free slot unless it is already present.
    ///
    /// Returns the new slot id, or `None` if the key was already present. The table is not
    /// modified in that case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if the key is absent and no slot is available.
    pub fn try_add_no_resize(&mut self, key: K) -> Result<Option<usize>> {
        if self.contains_key(&key) {
            return Ok(None);
        }

        self.add_unchecked_no_resize(key).map(Some)
    }

    /// Inserts `key` with a value record unless the key is already present.
    ///
    /// Returns the new slot id, or `None` if the key was already present. Neither the table nor
    /// the existing value record is modified in that case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueSizeMismatch`] if `V` does not have the record size and
    /// [`Error::SlotOutOfRange`] if the key is absent and no slot is available.
    pub fn try_add_no_resize_with_value<V: NoUninit>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<Option<usize>> {
        self.check_value_size::<V>()?;

        if self.contains_key(&key) {
            return Ok(None);
        }

        self.add_unchecked_no_resize_with_value(key, value).map(Some)
    }

    /// Returns the slot id holding `key`, inserting it into a free slot if it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if the key is absent and no slot is available.
    pub fn find_or_add_no_resize(&mut self, key: K) -> Result<usize> {
        match self.find(&key) {
            Some(slot) => Ok(slot),
            None => self.add_unchecked_no_resize(key),
        }
    }

    /// Inserts every key of `keys` in order, without checking for duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if fewer slots are available than there are keys.
    /// Nothing is inserted in that case.
    pub fn add_range_unchecked_no_resize(&mut self, keys: &[K]) -> Result<()> {
        // Every unoccupied slot below the capacity is either on the free list or above the
        // high-water mark. Cannot underflow because count <= capacity.
        let available = self.capacity.wrapping_sub(self.count);

        if keys.len() > available {
            return Err(Error::CapacityExceeded {
                requested: self.count.saturating_add(keys.len()),
                available: self.capacity,
            });
        }

        for key in keys {
            self.add_unchecked_no_resize(*key)?;
        }

        Ok(())
    }

    /// Inserts `key` without checking whether it is already present, growing the table if no
    /// slot is available.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed. The table is unchanged in that case.
    pub fn add(&mut self, key: K) -> Result<usize> {
        self.ensure_capacity(self.count.saturating_add(1))?;
        self.add_unchecked_no_resize(key)
    }

    /// Inserts `key` unless it is already present, growing the table if no slot is available.
    ///
    /// Returns the new slot id, or `None` if the key was already present.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed. The table is unchanged in that case.
    pub fn try_add(&mut self, key: K) -> Result<Option<usize>> {
        if self.contains_key(&key) {
            return Ok(None);
        }

        self.add(key).map(Some)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        self.try_remove(key).is_some()
    }

    /// Removes `key`, returning the slot id it occupied.
    ///
    /// The slot goes to the front of the free list and is the next one handed out. Its key and
    /// value record are left as they are until the slot is reused.
    pub fn try_remove(&mut self, key: &K) -> Option<usize> {
        let bucket = self.bucket_index(key);

        let mut previous = None;
        let mut current = self.bucket_head(bucket);

        while current != NO_SLOT {
            let following = self.next_of(current);

            if self.key_of(current) == key {
                match previous {
                    Some(previous) => self.set_next(previous, following),
                    None => self.set_bucket_head(bucket, following),
                }

                self.set_next(current, self.first_free.unwrap_or(NO_SLOT));
                self.first_free = Some(current);

                // Cannot underflow because the slot we just unlinked was counted.
                self.count = self.count.wrapping_sub(1);

                #[cfg(any(debug_assertions, feature = "integrity_checks"))]
                self.integrity_check();

                return Some(current);
            }

            previous = Some(current);
            current = following;
        }

        None
    }

    /// Ensures at least `capacity` slots can be handed out, growing the table if needed.
    ///
    /// # Errors
    ///
    /// See [`resize()`][Self::resize].
    #[inline]
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.capacity {
            return Ok(());
        }

        self.resize(capacity)
    }

    /// Grows the slot capacity to `new_capacity` rounded up to a power of two.
    ///
    /// Does nothing if the table already has that many slots; the table never shrinks. If the
    /// bucket count has to grow as well, every chain is rebuilt from the occupied slots. Slot
    /// ids are not affected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the capacity cannot be represented and
    /// [`Error::AllocationFailed`] if the allocator refuses a request. The table keeps its
    /// previous capacity and contents in that case.
    pub fn resize(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.capacity {
            return Ok(());
        }

        let capacity_exceeded = Error::CapacityExceeded {
            requested: new_capacity,
            available: self.capacity,
        };

        let new_capacity = new_capacity
            .checked_next_power_of_two()
            .ok_or(capacity_exceeded)?;

        let new_bucket_capacity = new_capacity
            .checked_mul(self.buckets_per_slot.get())
            .and_then(usize::checked_next_power_of_two)
            .ok_or(Error::CapacityExceeded {
                requested: new_capacity,
                available: self.capacity,
            })?;

        // Allocate the new buckets before touching anything so a refusal leaves the table as is.
        let new_buckets = if new_bucket_capacity > self.bucket_capacity() {
            Some(empty_buckets(new_bucket_capacity, self.allocator.clone())?)
        } else {
            None
        };

        self.keys.ensure_capacity(new_capacity)?;
        self.next.ensure_capacity(new_capacity)?;

        if let Some(values) = &mut self.values {
            values.ensure_capacity(new_capacity)?;
        }

        debug!(
            old_capacity = self.capacity,
            new_capacity,
            bucket_capacity = new_bucket_capacity.max(self.bucket_capacity()),
            "resized hash table"
        );

        self.capacity = new_capacity;

        if let Some(new_buckets) = new_buckets {
            self.rebuild_chains(new_buckets);
        }

        #[cfg(any(debug_assertions, feature = "integrity_checks"))]
        self.integrity_check();

        Ok(())
    }

    /// Removes every key, keeping the capacity. Slot ids start from zero again afterwards.
    pub fn clear(&mut self) {
        trace!(count = self.count, "clearing hash table");

        self.keys.clear();
        self.next.clear();

        if let Some(values) = &mut self.values {
            values.clear();
        }

        self.buckets.as_mut_slice().fill(NO_SLOT);
        self.first_free = None;
        self.count = 0;
    }

    /// Reads the value record of `slot` as a `T`.
    ///
    /// Any slot below [`allocated_index()`][Self::allocated_index] can be read, including free
    /// slots, whose record holds whatever was last written to it. Records of slots that were
    /// never written are zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueSizeMismatch`] if `T` does not have the record size and
    /// [`Error::IndexOutOfRange`] if the slot was never handed out.
    pub fn get_value<T: AnyBitPattern>(&self, slot: usize) -> Result<T> {
        self.check_value_size::<T>()?;
        self.check_allocated(slot)?;

        let Some(values) = &self.values else {
            return Ok(T::zeroed());
        };

        // SAFETY: Every record below the length was zero-filled when its slot was handed out,
        // so all bytes are initialized.
        let bytes = unsafe { values.as_bytes() };

        let record = bytes
            .get(record_range(slot, self.value_layout.size()))
            .expect("slot was validated against the allocated records");

        Ok(bytemuck::pod_read_unaligned(record))
    }

    /// Writes `value` into the value record of `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueSizeMismatch`] if `T` does not have the record size and
    /// [`Error::IndexOutOfRange`] if the slot was never handed out.
    pub fn set_value<T: NoUninit>(&mut self, slot: usize, value: T) -> Result<()> {
        self.check_value_size::<T>()?;
        self.check_allocated(slot)?;

        self.write_value(slot, bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Returns the key held by `slot`.
    ///
    /// Runs in time proportional to the length of the free list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if the slot was never handed out and
    /// [`Error::VacantSlot`] if it is on the free list.
    pub fn key_at(&self, slot: usize) -> Result<&K> {
        self.check_allocated(slot)?;

        if self.free_slots().any(|free| free == slot) {
            return Err(Error::VacantSlot { slot });
        }

        Ok(self.key_of(slot))
    }

    /// Copies every key into a new list, in bucket order and chain order within each bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be allocated.
    pub fn get_key_array(&self) -> Result<RawList<K, A>> {
        let mut result = RawList::create(self.count, self.allocator.clone())?;

        for key in self.keys() {
            result.push_no_resize(*key)?;
        }

        Ok(result)
    }

    /// Iterates over every key, in bucket order and chain order within each bucket.
    #[must_use]
    pub fn keys(&self) -> Keys<'_, K> {
        Keys {
            buckets: self.buckets.as_slice().iter(),
            chain: SlotChain::new(self.next.as_slice(), NO_SLOT),
            keys: self.keys.as_slice(),
        }
    }

    /// Iterates over the slot ids chained into `bucket`, most recently inserted first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `bucket` is not below the bucket capacity.
    pub fn chain(&self, bucket: usize) -> Result<SlotChain<'_>> {
        let head = self
            .buckets
            .element_at(bucket)
            .map_err(|_| Error::IndexOutOfRange {
                index: bucket,
                length: self.bucket_capacity(),
            })?;

        Ok(SlotChain::new(self.next.as_slice(), *head))
    }

    /// Iterates over the free slot ids in the order they will be handed out again.
    #[must_use]
    pub fn free_slots(&self) -> SlotChain<'_> {
        SlotChain::new(self.next.as_slice(), self.first_free.unwrap_or(NO_SLOT))
    }

    fn bucket_for_hash(&self, hash: u64) -> usize {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "only the low bits select the bucket"
        )]
        let hash = hash as usize;

        // Cannot underflow because there is always at least one bucket.
        hash & self.bucket_capacity().wrapping_sub(1)
    }

    fn bucket_head(&self, bucket: usize) -> usize {
        *self
            .buckets
            .element_at(bucket)
            .expect("bucket indexes are always masked to the bucket capacity")
    }

    fn set_bucket_head(&mut self, bucket: usize, slot: usize) {
        *self
            .buckets
            .element_at_mut(bucket)
            .expect("bucket indexes are always masked to the bucket capacity") = slot;
    }

    fn next_of(&self, slot: usize) -> usize {
        *self
            .next
            .element_at(slot)
            .expect("linked slots are always allocated")
    }

    fn set_next(&mut self, slot: usize, link: usize) {
        *self
            .next
            .element_at_mut(slot)
            .expect("linked slots are always allocated") = link;
    }

    fn key_of(&self, slot: usize) -> &K {
        self.keys
            .element_at(slot)
            .expect("linked slots are always allocated")
    }

    /// Hands out a slot for `key` and stores the key in it, without linking it into a chain.
    fn take_slot(&mut self, key: K) -> Result<usize> {
        if let Some(slot) = self.first_free {
            if slot >= self.capacity {
                return Err(Error::SlotOutOfRange {
                    slot,
                    capacity: self.capacity,
                });
            }

            self.first_free = link_to_slot(self.next_of(slot));
            *self
                .keys
                .element_at_mut(slot)
                .expect("free slots are always allocated") = key;

            return Ok(slot);
        }

        let slot = self.allocated_index();

        if slot >= self.capacity {
            return Err(Error::SlotOutOfRange {
                slot,
                capacity: self.capacity,
            });
        }

        // Every slot array holds at least `capacity` elements, so none of these can fail.
        self.keys.push_no_resize(key)?;
        self.next.push_no_resize(NO_SLOT)?;

        if let Some(values) = &mut self.values {
            push_zeroed_record(values)?;
        }

        Ok(slot)
    }

    /// Pushes `slot` onto the front of the chain of the bucket `key` belongs to.
    fn link(&mut self, slot: usize, key: K) {
        let bucket = self.bucket_index(&key);

        self.set_next(slot, self.bucket_head(bucket));
        self.set_bucket_head(bucket, slot);

        // Cannot overflow because count never exceeds the capacity.
        self.count = self.count.wrapping_add(1);
    }

    /// Replaces the buckets and relinks every occupied slot into them.
    fn rebuild_chains(&mut self, new_buckets: RawList<usize, A>) {
        debug!(
            old_bucket_capacity = self.bucket_capacity(),
            new_bucket_capacity = new_buckets.len(),
            count = self.count,
            "rebuilding hash table chains"
        );

        let old_buckets = mem::replace(&mut self.buckets, new_buckets);
        let occupied = self.count;
        self.count = 0;

        // Walking the old chains visits exactly the occupied slots, skipping free ones.
        for head in old_buckets.as_slice() {
            let mut slot = *head;

            while slot != NO_SLOT {
                let following = self.next_of(slot);
                let key = *self.key_of(slot);

                self.link(slot, key);
                slot = following;
            }
        }

        debug_assert_eq!(self.count, occupied);
    }

    fn check_value_size<T>(&self) -> Result<()> {
        if size_of::<T>() != self.value_layout.size() {
            return Err(Error::ValueSizeMismatch {
                expected: self.value_layout.size(),
                actual: size_of::<T>(),
            });
        }

        Ok(())
    }

    fn check_allocated(&self, slot: usize) -> Result<()> {
        if slot >= self.allocated_index() {
            return Err(Error::IndexOutOfRange {
                index: slot,
                length: self.allocated_index(),
            });
        }

        Ok(())
    }

    /// Copies a whole value record into an allocated slot.
    fn write_value(&mut self, slot: usize, record: &[u8]) {
        let Some(values) = &mut self.values else {
            return;
        };

        debug_assert_eq!(record.len(), self.value_layout.size());

        let target = values
            .as_uninit_bytes_mut()
            .get_mut(record_range(slot, record.len()))
            .expect("slot was validated against the allocated records");

        // SAFETY: The target is exactly one record long and belongs to the block we borrow
        // exclusively, so it cannot overlap the source.
        unsafe {
            ptr::copy_nonoverlapping(record.as_ptr(), target.as_mut_ptr().cast::<u8>(), record.len());
        }
    }

    /// Asserts the constant-time invariants and, in tests or with the `integrity_checks`
    /// feature, walks every chain and the free list.
    #[cfg(any(debug_assertions, feature = "integrity_checks"))]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self) {
        let allocated = self.allocated_index();

        assert!(
            self.count <= allocated && allocated <= self.capacity,
            "count {} <= allocated index {} <= capacity {} does not hold",
            self.count,
            allocated,
            self.capacity,
        );

        assert_eq!(self.next.len(), allocated, "link array out of sync with keys");

        if let Some(values) = &self.values {
            assert_eq!(values.len(), allocated, "value records out of sync with keys");
        }

        assert!(
            self.bucket_capacity().is_power_of_two(),
            "bucket capacity {} is not a power of two",
            self.bucket_capacity(),
        );

        #[cfg(any(test, feature = "integrity_checks"))]
        self.walk_integrity_check();
    }

    /// Verifies that every allocated slot is either chained into its own bucket or on the free
    /// list, exactly once. Linear in the allocated slots and buckets.
    #[cfg(any(test, feature = "integrity_checks"))]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    fn walk_integrity_check(&self) {
        let allocated = self.allocated_index();

        let mut visited = vec![false; allocated];
        let mut chained: usize = 0;

        for (bucket, head) in self.buckets.as_slice().iter().enumerate() {
            for slot in SlotChain::new(self.next.as_slice(), *head) {
                let seen = visited
                    .get_mut(slot)
                    .unwrap_or_else(|| panic!("bucket {bucket} links to unallocated slot {slot}"));

                assert!(!*seen, "slot {slot} is reachable more than once");
                *seen = true;
                chained = chained.wrapping_add(1);

                assert_eq!(
                    self.bucket_index(self.key_of(slot)),
                    bucket,
                    "slot {slot} is chained into the wrong bucket"
                );
            }
        }

        assert_eq!(
            chained, self.count,
            "chains hold {chained} slots but count is {}",
            self.count
        );

        let mut free: usize = 0;

        for slot in self.free_slots() {
            let seen = visited
                .get_mut(slot)
                .unwrap_or_else(|| panic!("free list links to unallocated slot {slot}"));

            assert!(!*seen, "free slot {slot} is also chained or listed twice");
            *seen = true;
            free = free.wrapping_add(1);
        }

        assert_eq!(
            chained.wrapping_add(free),
            allocated,
            "some allocated slots are neither chained nor free"
        );
    }
}

impl<K, S, A> RawHashTable<K, S, A>
where
    K: Copy + Eq + Hash + AsByteSpan,
    S: BuildHasher,
    A: BlockAllocator + Clone,
{
    /// Returns the slot id of the key whose byte content equals `key`, if any.
    ///
    /// The bucket is derived from the byte content, so this finds keys inserted by value as long
    /// as the key type hashes like its [`ByteSpan`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] if the key type is [`ByteSpan`] itself. Use
    /// [`find()`][Self::find] for such tables.
    pub fn find_normalized_string_key_index(&self, key: ByteSpan<'_>) -> Result<Option<usize>> {
        if K::IS_BYTE_SPAN {
            return Err(Error::Unsupported {
                operation: "string-keyed lookup in a table keyed by ByteSpan",
            });
        }

        let bucket = self.bucket_for_hash(self.hasher.hash_one(key));

        Ok(SlotChain::new(self.next.as_slice(), self.bucket_head(bucket))
            .find(|slot| self.key_of(*slot).as_byte_span() == key))
    }

    /// Whether any key has the byte content of `key`.
    ///
    /// # Errors
    ///
    /// See [`find_normalized_string_key_index()`][Self::find_normalized_string_key_index].
    pub fn contains_normalized_string_key(&self, key: ByteSpan<'_>) -> Result<bool> {
        self.find_normalized_string_key_index(key)
            .map(|slot| slot.is_some())
    }
}

impl<K, S, A> fmt::Debug for RawHashTable<K, S, A>
where
    K: Copy + Eq + Hash,
    S: BuildHasher,
    A: BlockAllocator + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHashTable")
            .field("count", &self.count)
            .field("capacity", &self.capacity)
            .field("allocated_index", &self.allocated_index())
            .field("bucket_capacity", &self.bucket_capacity())
            .field("first_free", &self.first_free)
            .field("value_layout", &self.value_layout)
            .finish_non_exhaustive()
    }
}

/// Iterator over a linked list of slot ids, either one bucket chain or the free list.
///
/// Returned by [`RawHashTable::chain()`] and [`RawHashTable::free_slots()`].
#[derive(Clone, Debug)]
pub struct SlotChain<'a> {
    links: &'a [usize],
    current: usize,
}

impl<'a> SlotChain<'a> {
    fn new(links: &'a [usize], head: usize) -> Self {
        Self {
            links,
            current: head,
        }
    }
}

impl Iterator for SlotChain<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = link_to_slot(self.current)?;
        self.current = self.links.get(slot).copied().unwrap_or(NO_SLOT);
        Some(slot)
    }
}

impl FusedIterator for SlotChain<'_> {}

/// Iterator over the keys of a [`RawHashTable`], in bucket order.
///
/// Returned by [`RawHashTable::keys()`].
#[derive(Clone, Debug)]
pub struct Keys<'a, K> {
    buckets: slice::Iter<'a, usize>,
    chain: SlotChain<'a>,
    keys: &'a [K],
}

impl<'a, K> Iterator for Keys<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(slot) = self.chain.next() {
                return self.keys.get(slot);
            }

            let head = *self.buckets.next()?;
            self.chain = SlotChain::new(self.chain.links, head);
        }
    }
}

impl<K> FusedIterator for Keys<'_, K> {}

fn link_to_slot(link: usize) -> Option<usize> {
    (link != NO_SLOT).then_some(link)
}

/// Creates `bucket_capacity` buckets with empty chains.
fn empty_buckets<A: BlockAllocator>(
    bucket_capacity: usize,
    allocator: A,
) -> Result<RawList<usize, A>> {
    let mut buckets = RawList::new_in(allocator);
    buckets.ensure_capacity(bucket_capacity)?;

    for _ in 0..bucket_capacity {
        buckets.push_no_resize(NO_SLOT)?;
    }

    Ok(buckets)
}

/// Byte range of the value record of `slot`.
fn record_range(slot: usize, record_size: usize) -> Range<usize> {
    // Cannot overflow for allocated slots because their records lie within one block.
    let start = slot.wrapping_mul(record_size);
    start..start.wrapping_add(record_size)
}

/// Appends one zero-filled record to the value records.
fn push_zeroed_record<A: BlockAllocator>(values: &mut BufferHeader<A>) -> Result<()> {
    let length = values.len();

    if length >= values.capacity() {
        return Err(Error::CapacityExceeded {
            requested: length.saturating_add(1),
            available: values.capacity(),
        });
    }

    let record_size = values.element_layout().size();

    for byte in values
        .as_uninit_bytes_mut()
        .get_mut(record_range(length, record_size))
        .expect("record was validated against the capacity above")
    {
        byte.write(0);
    }

    // SAFETY: The new record was zero-filled above and lies within the capacity. Cannot
    // overflow because the length is below the capacity.
    unsafe {
        values.set_len(length.wrapping_add(1));
    }

    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::hash::{BuildHasherDefault, Hasher};

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::FixedBytes;
    use crate::testing::{CountingAllocator, RefusingAllocator};

    assert_impl_all!(RawHashTable<u64>: Send);
    assert_not_impl_any!(RawHashTable<u64>: Sync);
    assert_impl_all!(SlotChain<'static>: Send, Sync, Iterator);

    /// Hashes integers to their parity, so odd keys always collide.
    #[derive(Default)]
    struct ParityHasher(u64);

    impl Hasher for ParityHasher {
        fn finish(&self) -> u64 {
            self.0 % 2
        }

        fn write(&mut self, bytes: &[u8]) {
            for byte in bytes {
                self.0 = self.0.wrapping_mul(256).wrapping_add(u64::from(*byte));
            }
        }

        fn write_u64(&mut self, value: u64) {
            self.0 = value;
        }
    }

    type ParityTable = RawHashTable<u64, BuildHasherDefault<ParityHasher>>;

    fn parity_table(capacity: usize) -> ParityTable {
        RawHashTable::<u64>::builder()
            .capacity(capacity)
            .buckets_per_slot(nz!(1))
            .hasher(BuildHasherDefault::<ParityHasher>::default())
            .build()
            .unwrap()
    }

    fn table(capacity: usize) -> RawHashTable<u64> {
        RawHashTable::with_capacity(capacity).unwrap()
    }

    fn chained_slots<K, S, A>(table: &RawHashTable<K, S, A>) -> usize
    where
        K: Copy + Eq + Hash,
        S: BuildHasher,
        A: BlockAllocator + Clone,
    {
        (0..table.bucket_capacity())
            .map(|bucket| table.chain(bucket).unwrap().count())
            .sum()
    }

    #[test]
    fn find_returns_inserted_slot() {
        let mut table = table(16);

        let slots: Vec<usize> = (100..110)
            .map(|key| table.add_unchecked_no_resize(key).unwrap())
            .collect();

        for (key, slot) in (100..110).zip(slots) {
            assert_eq!(table.find(&key), Some(slot));
        }

        assert_eq!(table.find(&5), None);
        assert_eq!(table.len(), 10);
        assert_eq!(table.allocated_index(), 10);
    }

    #[test]
    fn colliding_keys_share_a_chain() {
        let mut table = parity_table(4);
        assert_eq!(table.bucket_capacity(), 4);
        assert_eq!(table.bucket_index(&1), table.bucket_index(&3));

        let one = table.add_unchecked_no_resize(1).unwrap();
        let two = table.add_unchecked_no_resize(2).unwrap();
        let three = table.add_unchecked_no_resize(3).unwrap();

        assert_eq!(table.find(&3), Some(three));
        assert_eq!(table.find(&2), Some(two));
        assert_eq!(
            table
                .chain(table.bucket_index(&1))
                .unwrap()
                .collect::<Vec<_>>(),
            vec![three, one]
        );

        assert!(table.remove(&1));

        assert_eq!(table.find(&3), Some(three));
        assert_eq!(table.find(&1), None);
    }

    #[test]
    fn removing_chain_head_keeps_tail_reachable() {
        let mut table = parity_table(4);
        table.add_unchecked_no_resize(1).unwrap();
        table.add_unchecked_no_resize(3).unwrap();
        let five = table.add_unchecked_no_resize(5).unwrap();

        assert_eq!(table.try_remove(&5), Some(five));

        assert!(table.contains_key(&1));
        assert!(table.contains_key(&3));
        assert!(!table.contains_key(&5));
    }

    #[test]
    fn freed_slots_are_reused_most_recent_first() {
        let mut table = table(8);
        for key in 0..5 {
            table.add_unchecked_no_resize(key).unwrap();
        }

        let first = table.try_remove(&1).unwrap();
        let second = table.try_remove(&3).unwrap();

        assert_eq!(table.free_slots().collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(table.len(), 3);

        assert_eq!(table.add_unchecked_no_resize(10).unwrap(), second);
        assert_eq!(table.add_unchecked_no_resize(11).unwrap(), first);
        assert_eq!(table.add_unchecked_no_resize(12).unwrap(), 5);
        assert_eq!(table.free_slots().count(), 0);
    }

    #[test]
    fn remove_absent_key_changes_nothing() {
        let mut table = table(4);
        table.add_unchecked_no_resize(1).unwrap();

        assert!(!table.remove(&2));
        assert_eq!(table.len(), 1);
        assert_eq!(table.free_slots().count(), 0);
    }

    #[test]
    fn chains_visit_every_occupied_slot_once() {
        let mut table = table(64);
        for key in 0..50 {
            table.add_unchecked_no_resize(key * 7).unwrap();
        }
        for key in 0..20 {
            assert!(table.remove(&(key * 7 * 2)));
        }

        assert_eq!(chained_slots(&table), table.len());
        assert_eq!(table.len(), 30);
        assert_eq!(table.free_slots().count(), 20);
    }

    #[test]
    fn full_table_rejects_insert() {
        let mut table = table(2);
        let capacity = table.capacity();

        for key in 0..capacity {
            table
                .add_unchecked_no_resize(u64::try_from(key).unwrap())
                .unwrap();
        }

        assert_eq!(
            table.add_unchecked_no_resize(1000),
            Err(Error::SlotOutOfRange {
                slot: capacity,
                capacity
            })
        );
        assert_eq!(table.len(), capacity);
        assert_eq!(table.find(&1000), None);
    }

    #[test]
    fn try_add_reports_present_key() {
        let mut table = table(4);

        let slot = table.try_add_no_resize(9).unwrap();
        assert!(slot.is_some());

        assert_eq!(table.try_add_no_resize(9), Ok(None));
        assert_eq!(table.len(), 1);

        assert_eq!(table.find_or_add_no_resize(9), Ok(slot.unwrap()));
        let other = table.find_or_add_no_resize(10).unwrap();
        assert_eq!(table.find(&10), Some(other));
    }

    #[test]
    fn duplicates_via_unchecked_add() {
        let mut table = table(4);

        let older = table.add_unchecked_no_resize(1).unwrap();
        let newer = table.add_unchecked_no_resize(1).unwrap();

        assert_eq!(table.find(&1), Some(newer));
        assert_eq!(table.try_remove(&1), Some(newer));
        assert_eq!(table.find(&1), Some(older));
    }

    #[test]
    fn values_round_trip() {
        let mut table = RawHashTable::<u32>::builder()
            .capacity(8)
            .value_of::<[u16; 3]>()
            .build()
            .unwrap();

        let slot = table
            .add_unchecked_no_resize_with_value(5, [1_u16, 2, 3])
            .unwrap();
        let other = table.add_unchecked_no_resize(6).unwrap();

        assert_eq!(table.get_value::<[u16; 3]>(slot), Ok([1, 2, 3]));
        assert_eq!(table.get_value::<[u16; 3]>(other), Ok([0, 0, 0]));

        table.set_value(other, [7_u16, 8, 9]).unwrap();
        assert_eq!(table.get_value::<[u16; 3]>(other), Ok([7, 8, 9]));

        // Any type of the same size can be used.
        assert!(table.get_value::<[u8; 6]>(slot).is_ok());
    }

    #[test]
    fn value_size_mismatch_is_rejected() {
        let mut table = RawHashTable::<u32>::builder()
            .capacity(8)
            .value_of::<u32>()
            .build()
            .unwrap();
        let slot = table.add_unchecked_no_resize(1).unwrap();

        let mismatch = || Error::ValueSizeMismatch {
            expected: 4,
            actual: 8,
        };

        assert_eq!(table.get_value::<u64>(slot), Err(mismatch()));
        assert_eq!(table.set_value(slot, 1_u64), Err(mismatch()));
        assert_eq!(
            table.add_unchecked_no_resize_with_value(2, 1_u64),
            Err(mismatch())
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn value_access_requires_allocated_slot() {
        let mut table = RawHashTable::<u32>::builder()
            .capacity(8)
            .value_of::<u32>()
            .build()
            .unwrap();

        assert_eq!(
            table.set_value(0, 1_u32),
            Err(Error::IndexOutOfRange {
                index: 0,
                length: 0
            })
        );
        assert!(table.get_value::<u32>(0).is_err());
    }

    #[test]
    fn try_add_with_value_keeps_existing_value() {
        let mut table = RawHashTable::<u32>::builder()
            .capacity(8)
            .value_of::<u32>()
            .build()
            .unwrap();

        let slot = table
            .try_add_no_resize_with_value(1, 10_u32)
            .unwrap()
            .unwrap();

        assert_eq!(table.try_add_no_resize_with_value(1, 20_u32), Ok(None));
        assert_eq!(table.get_value::<u32>(slot), Ok(10));
    }

    #[test]
    fn table_without_values_accepts_zero_sized_access() {
        let mut table = table(4);
        let slot = table.add_unchecked_no_resize(1).unwrap();

        assert_eq!(table.value_layout().size(), 0);
        assert_eq!(table.get_value::<()>(slot), Ok(()));
        assert!(table.set_value(slot, 1_u8).is_err());
    }

    #[test]
    fn add_grows_capacity_and_buckets() {
        let allocator = CountingAllocator::default();
        let mut table = RawHashTable::<u64>::builder()
            .allocator(&allocator)
            .build()
            .unwrap();

        assert_eq!(table.capacity(), 0);

        let slots: Vec<usize> = (0..100).map(|key| table.add(key).unwrap()).collect();

        assert_eq!(table.capacity(), 128);
        assert_eq!(table.bucket_capacity(), 256);
        assert_eq!(chained_slots(&table), 100);

        for (key, slot) in (0..100).zip(slots) {
            assert_eq!(table.find(&key), Some(slot));
        }

        drop(table);
        assert_eq!(allocator.live_blocks(), 0);
    }

    #[test]
    fn resize_preserves_free_list() {
        let mut table = table(4);
        for key in 0..4 {
            table.add_unchecked_no_resize(key).unwrap();
        }
        let freed = table.try_remove(&2).unwrap();

        table.resize(100).unwrap();

        assert_eq!(table.capacity(), 128);
        assert_eq!(table.free_slots().collect::<Vec<_>>(), vec![freed]);
        assert_eq!(chained_slots(&table), 3);
        assert_eq!(table.add_unchecked_no_resize(99).unwrap(), freed);
    }

    #[test]
    fn resize_never_shrinks() {
        let mut table = table(64);

        table.resize(2).unwrap();

        assert_eq!(table.capacity(), 64);
    }

    #[test]
    fn refused_allocation_fails_build() {
        let result = RawHashTable::<u64>::builder()
            .capacity(4)
            .allocator(RefusingAllocator)
            .build();

        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
    }

    #[test]
    fn range_insert_is_all_or_nothing() {
        let mut table = table(4);

        assert!(matches!(
            table.add_range_unchecked_no_resize(&[1, 2, 3, 4, 5]),
            Err(Error::CapacityExceeded { .. })
        ));
        assert!(table.is_empty());

        table.add_range_unchecked_no_resize(&[1, 2, 3]).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.contains_key(&2));
    }

    #[test]
    fn try_add_grows_only_for_new_keys() {
        let mut table = RawHashTable::<u64>::with_capacity(0).unwrap();

        assert!(table.try_add(1).unwrap().is_some());
        let capacity = table.capacity();

        assert_eq!(table.try_add(1), Ok(None));
        assert_eq!(table.capacity(), capacity);
    }

    #[test]
    fn clear_resets_slots() {
        let mut table = table(8);
        table.add_range_unchecked_no_resize(&[1, 2, 3]).unwrap();
        table.remove(&2);

        table.clear();

        assert!(table.is_empty());
        assert_eq!(table.allocated_index(), 0);
        assert_eq!(table.free_slots().count(), 0);
        assert_eq!(table.find(&1), None);
        assert_eq!(table.add_unchecked_no_resize(4).unwrap(), 0);
    }

    #[test]
    fn key_at_rejects_free_and_unallocated_slots() {
        let mut table = table(8);
        let slot = table.add_unchecked_no_resize(40).unwrap();
        table.add_unchecked_no_resize(41).unwrap();

        assert_eq!(table.key_at(slot), Ok(&40));

        table.remove(&40);

        assert_eq!(table.key_at(slot), Err(Error::VacantSlot { slot }));
        assert_eq!(
            table.key_at(7),
            Err(Error::IndexOutOfRange {
                index: 7,
                length: 2
            })
        );
    }

    #[test]
    fn key_array_holds_occupied_keys() {
        let mut table = table(16);
        table.add_range_unchecked_no_resize(&[5, 6, 7, 8]).unwrap();
        table.remove(&6);

        let keys = table.get_key_array().unwrap();

        let mut sorted = keys.as_slice().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![5, 7, 8]);

        assert!(keys.as_slice().iter().eq(table.keys()));
    }

    #[test]
    fn chain_rejects_bucket_out_of_range() {
        let table = table(4);

        assert!(table.chain(table.bucket_capacity()).is_err());
        assert_eq!(table.chain(0).unwrap().count(), 0);
    }

    #[test]
    fn string_keys_are_found_by_content() {
        let mut table = RawHashTable::<FixedBytes<16>>::with_capacity(8).unwrap();

        let alpha = table
            .add_unchecked_no_resize(FixedBytes::try_from("alpha").unwrap())
            .unwrap();
        table
            .add_unchecked_no_resize(FixedBytes::try_from("beta").unwrap())
            .unwrap();

        let bytes = b"alpha".to_vec();

        assert_eq!(
            table.find_normalized_string_key_index(ByteSpan::new(&bytes)),
            Ok(Some(alpha))
        );
        assert_eq!(
            table.contains_normalized_string_key(ByteSpan::from("gamma")),
            Ok(false)
        );
    }

    #[test]
    fn string_lookup_rejects_byte_span_keys() {
        let mut table = RawHashTable::<ByteSpan<'static>>::with_capacity(4).unwrap();
        table
            .add_unchecked_no_resize(ByteSpan::from("key"))
            .unwrap();

        assert!(matches!(
            table.find_normalized_string_key_index(ByteSpan::from("key")),
            Err(Error::Unsupported { .. })
        ));
        assert!(table.contains_key(&ByteSpan::from("key")));
    }

    #[test]
    fn walk_accepts_mixed_operations() {
        let mut table = parity_table(4);

        for key in 0..40 {
            table.add(key).unwrap();
        }

        for key in (0..40).step_by(3) {
            assert!(table.remove(&key));
        }

        table.add(100).unwrap();
        table.walk_integrity_check();
    }

    #[test]
    #[should_panic(expected = "also chained")]
    fn walk_detects_chained_slot_on_free_list() {
        let mut table = table(4);
        let slot = table.add_unchecked_no_resize(1).unwrap();
        table.add_unchecked_no_resize(2).unwrap();

        table.first_free = Some(slot);

        table.walk_integrity_check();
    }

    #[test]
    #[should_panic(expected = "wrong bucket")]
    fn walk_detects_misplaced_slot() {
        let mut table = parity_table(4);
        let slot = table.add_unchecked_no_resize(1).unwrap();

        // Move the odd key's chain into the even bucket.
        table.set_bucket_head(1, NO_SLOT);
        table.set_bucket_head(0, slot);

        table.walk_integrity_check();
    }

    #[test]
    fn debug_output_names_counts() {
        let table = table(4);

        let output = format!("{table:?}");

        assert!(output.contains("RawHashTable"));
        assert!(output.contains("bucket_capacity"));
    }
}
