use std::alloc::Layout;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::num::NonZero;

use foldhash::fast::FixedState;
use new_zealand::nz;

use crate::{BlockAllocator, Global, RawHashTable, Result};

/// Number of buckets allocated per slot unless configured otherwise.
pub const DEFAULT_BUCKETS_PER_SLOT: NonZero<usize> = nz!(2);

/// Builder for creating an instance of [`RawHashTable`].
///
/// All settings are optional. By default the table has no slots, no value records, two buckets
/// per slot, the [`FixedState`] hasher and the [`Global`] allocator.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use raw_collections::RawHashTable;
///
/// let table = RawHashTable::<u64>::builder()
///     .capacity(1000)
///     .value_of::<[u8; 12]>()
///     .buckets_per_slot(NonZero::new(4).unwrap())
///     .build()?;
///
/// assert_eq!(table.capacity(), 1024);
/// assert_eq!(table.bucket_capacity(), 4096);
/// # Ok::<(), raw_collections::Error>(())
/// ```
#[must_use]
pub struct RawHashTableBuilder<K, S = FixedState, A = Global> {
    capacity: usize,
    value_layout: Layout,
    buckets_per_slot: NonZero<usize>,
    hasher: S,
    allocator: A,

    _key: PhantomData<fn() -> K>,
}

impl<K> RawHashTableBuilder<K> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            capacity: 0,
            value_layout: Layout::new::<()>(),
            buckets_per_slot: DEFAULT_BUCKETS_PER_SLOT,
            hasher: FixedState::default(),
            allocator: Global,
            _key: PhantomData,
        }
    }
}

impl<K, S, A> RawHashTableBuilder<K, S, A> {
    /// Sets the minimum number of slots the table starts with.
    ///
    /// The actual capacity is rounded up to a power of two.
    #[inline]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the layout of the value record stored with every slot.
    ///
    /// A zero-sized layout means the table stores no value records.
    #[inline]
    pub fn value_layout(mut self, layout: Layout) -> Self {
        self.value_layout = layout;
        self
    }

    /// Sets the layout of the value record to that of `V`.
    #[inline]
    pub fn value_of<V>(self) -> Self {
        self.value_layout(Layout::new::<V>())
    }

    /// Sets how many buckets the table keeps per slot.
    ///
    /// More buckets mean shorter chains at the cost of memory.
    #[inline]
    pub fn buckets_per_slot(mut self, buckets_per_slot: NonZero<usize>) -> Self {
        self.buckets_per_slot = buckets_per_slot;
        self
    }

    /// Sets the hasher used to assign keys to buckets.
    #[inline]
    pub fn hasher<S2>(self, hasher: S2) -> RawHashTableBuilder<K, S2, A> {
        RawHashTableBuilder {
            capacity: self.capacity,
            value_layout: self.value_layout,
            buckets_per_slot: self.buckets_per_slot,
            hasher,
            allocator: self.allocator,
            _key: PhantomData,
        }
    }

    /// Sets the allocator that provides every block of the table.
    #[inline]
    pub fn allocator<A2>(self, allocator: A2) -> RawHashTableBuilder<K, S, A2> {
        RawHashTableBuilder {
            capacity: self.capacity,
            value_layout: self.value_layout,
            buckets_per_slot: self.buckets_per_slot,
            hasher: self.hasher,
            allocator,
            _key: PhantomData,
        }
    }
}

impl<K, S, A> RawHashTableBuilder<K, S, A>
where
    K: Copy + Eq + Hash,
    S: BuildHasher,
    A: BlockAllocator + Clone,
{
    /// Builds the table and performs its initial allocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`][crate::Error::CapacityExceeded] if the capacity
    /// cannot be represented and [`Error::AllocationFailed`][crate::Error::AllocationFailed]
    /// if the allocator refuses a request.
    ///
    /// # Panics
    ///
    /// Panics if `K` is zero-sized.
    pub fn build(self) -> Result<RawHashTable<K, S, A>> {
        RawHashTable::new_inner(
            self.capacity,
            self.value_layout,
            self.buckets_per_slot,
            self.hasher,
            self.allocator,
        )
    }
}

impl<K, S, A> fmt::Debug for RawHashTableBuilder<K, S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHashTableBuilder")
            .field("capacity", &self.capacity)
            .field("value_layout", &self.value_layout)
            .field("buckets_per_slot", &self.buckets_per_slot)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::hash::RandomState;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Error;
    use crate::testing::RefusingAllocator;

    assert_impl_all!(RawHashTableBuilder<u64>: Send, Sync, fmt::Debug);

    #[test]
    fn defaults() {
        let builder = RawHashTableBuilder::<u64>::new();

        assert_eq!(builder.capacity, 0);
        assert_eq!(builder.value_layout.size(), 0);
        assert_eq!(builder.buckets_per_slot, DEFAULT_BUCKETS_PER_SLOT);

        let table = builder.build().unwrap();
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.bucket_capacity(), 1);
    }

    #[test]
    fn value_of_sets_layout() {
        let builder = RawHashTableBuilder::<u64>::new().value_of::<[u32; 3]>();

        assert_eq!(builder.value_layout, Layout::new::<[u32; 3]>());
    }

    #[test]
    fn value_layout_is_padded_to_alignment() {
        let layout = Layout::from_size_align(3, 4).unwrap();

        let table = RawHashTableBuilder::<u64>::new()
            .capacity(4)
            .value_layout(layout)
            .build()
            .unwrap();

        assert_eq!(table.value_layout().size(), 4);
    }

    #[test]
    fn buckets_per_slot_scales_bucket_capacity() {
        let table = RawHashTableBuilder::<u64>::new()
            .capacity(10)
            .buckets_per_slot(nz!(1))
            .build()
            .unwrap();

        assert_eq!(table.capacity(), 16);
        assert_eq!(table.bucket_capacity(), 16);

        let table = RawHashTableBuilder::<u64>::new()
            .capacity(10)
            .buckets_per_slot(nz!(3))
            .build()
            .unwrap();

        assert_eq!(table.bucket_capacity(), 64);
    }

    #[test]
    fn custom_hasher_is_used() {
        let table = RawHashTableBuilder::<u64>::new()
            .hasher(RandomState::new())
            .capacity(8)
            .build()
            .unwrap();

        let expected = table.hasher().hash_one(5_u64);
        let mask = table.bucket_capacity() - 1;

        #[expect(clippy::cast_possible_truncation, reason = "test mirrors bucket masking")]
        let expected_bucket = expected as usize & mask;

        assert_eq!(table.bucket_index(&5), expected_bucket);
    }

    #[test]
    fn allocator_failure_is_reported() {
        let result = RawHashTableBuilder::<u64>::new()
            .allocator(RefusingAllocator)
            .build();

        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
    }

    #[test]
    fn unrepresentable_capacity_is_reported() {
        let result = RawHashTableBuilder::<u64>::new()
            .capacity(usize::MAX)
            .build();

        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
    }

    #[test]
    #[should_panic]
    fn zero_sized_key_panics() {
        drop(RawHashTableBuilder::<()>::new().build());
    }
}
