use std::alloc::Layout;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::slice;

use tracing::{debug, warn};

use crate::{BlockAllocator, Error, Global, Result};

/// Size of a CPU cache line in bytes. First allocations are floored to at least this many bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// The header shared by every growable buffer in this crate.
///
/// Tracks one contiguous memory block holding `capacity` elements of a fixed element layout,
/// of which the first `length` are valid. The block is owned exclusively by the header and is
/// released when the header is dropped or replaced by a larger block during growth.
///
/// Typed containers ([`RawList`][crate::RawList], [`RawText`][crate::RawText],
/// [`AppendBuffer`][crate::AppendBuffer]) embed this header as their first field and expose it
/// via `header()`, so code that only cares about length and capacity can work with any of them.
///
/// # Growth
///
/// [`ensure_capacity()`][Self::ensure_capacity] is the only operation that replaces the block.
/// The new capacity is always the requested capacity rounded up to a power of two. The first
/// `length` elements are copied into the new block and the old block is freed before the call
/// returns. Any element references obtained earlier are invalidated, which the borrow checker
/// enforces because growth takes `&mut self`.
///
/// # Thread safety
///
/// The header is thread-mobile ([`Send`]) if the allocator is, but it is not thread-safe
/// ([`Sync`]).
#[derive(Debug)]
#[repr(C)]
pub struct BufferHeader<A: BlockAllocator = Global> {
    /// The owned block, `None` if and only if `capacity` is zero.
    ptr: Option<NonNull<u8>>,

    /// Number of valid elements at the start of the block.
    length: usize,

    /// Number of elements the block can hold.
    capacity: usize,

    /// `None` if the header was never created with an allocator capability.
    allocator: Option<A>,

    /// Size and alignment of one element. The block is aligned to the element alignment.
    element_layout: Layout,
}

impl<A: BlockAllocator> BufferHeader<A> {
    /// Creates a header that has no allocator capability and can never hold elements.
    ///
    /// Any operation that needs memory fails with [`Error::NotCreated`].
    ///
    /// # Panics
    ///
    /// Panics if the element layout has zero size.
    #[must_use]
    pub const fn uncreated(element_layout: Layout) -> Self {
        assert!(
            element_layout.size() > 0,
            "BufferHeader must have non-zero element size"
        );

        Self {
            ptr: None,
            length: 0,
            capacity: 0,
            allocator: None,
            element_layout,
        }
    }

    /// Creates an empty header with zero capacity, backed by the given allocator.
    ///
    /// # Panics
    ///
    /// Panics if the element layout has zero size.
    #[must_use]
    pub fn new_in(element_layout: Layout, allocator: A) -> Self {
        let mut header = Self::uncreated(element_layout);
        header.allocator = Some(allocator);
        header
    }

    /// Creates a header and performs its first allocation.
    ///
    /// The capacity is floored so that the block covers at least one cache line and then
    /// rounded up to a power of two, so small buffers never allocate sub-cache-line blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the capacity cannot be represented as a block size
    /// and [`Error::AllocationFailed`] if the allocator refuses the request.
    ///
    /// # Panics
    ///
    /// Panics if the element layout has zero size.
    pub fn with_capacity_in(element_layout: Layout, capacity: usize, allocator: A) -> Result<Self> {
        let mut header = Self::new_in(element_layout, allocator);
        header.ensure_capacity(capacity.max(cache_line_floor(element_layout)))?;
        Ok(header)
    }

    /// Whether the header was created with an allocator capability.
    #[must_use]
    #[inline]
    pub fn is_created(&self) -> bool {
        self.allocator.is_some()
    }

    /// Number of valid elements.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether there are no valid elements.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of elements the current block can hold.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Layout of a single element.
    #[must_use]
    #[inline]
    pub fn element_layout(&self) -> Layout {
        self.element_layout
    }

    /// The allocator capability backing this header, if it was created with one.
    #[must_use]
    #[inline]
    pub fn allocator(&self) -> Option<&A> {
        self.allocator.as_ref()
    }

    /// Ensures the header can hold at least `required` elements, growing the block if needed.
    ///
    /// This is a no-op if the capacity is already sufficient. Otherwise the capacity becomes
    /// `required` rounded up to the next power of two.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCreated`] if the header has no allocator capability,
    /// [`Error::CapacityExceeded`] if the rounded capacity cannot be represented as a block size
    /// and [`Error::AllocationFailed`] if the allocator refuses the request. On error, the
    /// header is unchanged.
    #[inline]
    pub fn ensure_capacity(&mut self, required: usize) -> Result<()> {
        if required <= self.capacity {
            return Ok(());
        }

        self.grow(required)
    }

    /// Ensures there is room for at least `slack` more elements beyond the current length.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_capacity()`][Self::ensure_capacity], plus [`Error::CapacityExceeded`]
    /// if `length + slack` overflows.
    #[inline]
    pub fn ensure_slack(&mut self, slack: usize) -> Result<()> {
        let required = self
            .length
            .checked_add(slack)
            .ok_or(Error::CapacityExceeded {
                requested: usize::MAX,
                available: self.capacity,
            })?;

        self.ensure_capacity(required)
    }

    /// Sets the number of valid elements to zero. The block is retained.
    #[inline]
    pub fn clear(&mut self) {
        self.length = 0;
    }

    #[cold]
    #[inline(never)]
    fn grow(&mut self, required: usize) -> Result<()> {
        debug_assert!(required > self.capacity);

        let allocator = self.allocator.as_ref().ok_or(Error::NotCreated)?;

        let new_capacity = required
            .checked_next_power_of_two()
            .ok_or(Error::CapacityExceeded {
                requested: required,
                available: self.capacity,
            })?;

        let new_layout = block_layout(self.element_layout, new_capacity).ok_or(
            Error::CapacityExceeded {
                requested: new_capacity,
                available: self.capacity,
            },
        )?;

        let Some(new_block) = allocator.allocate(new_layout) else {
            warn!(
                bytes = new_layout.size(),
                alignment = new_layout.align(),
                "allocator refused buffer growth"
            );

            return Err(Error::AllocationFailed {
                bytes: new_layout.size(),
                alignment: new_layout.align(),
            });
        };

        if let Some(old_block) = self.ptr {
            // Cannot overflow because the live elements fit in the old block.
            let live_bytes = self.length.wrapping_mul(self.element_layout.size());

            // SAFETY: The old block holds `length` initialized elements and the new block is
            // larger than the old one. The blocks are distinct allocations, so they cannot overlap.
            unsafe {
                ptr::copy_nonoverlapping(old_block.as_ptr(), new_block.as_ptr(), live_bytes);
            }

            let old_layout = block_layout(self.element_layout, self.capacity)
                .expect("the layout of an existing block is always valid");

            // SAFETY: The old block was allocated by this allocator with this layout and we
            // stop referencing it right below.
            unsafe {
                allocator.free(old_block, old_layout);
            }
        }

        debug!(
            old_capacity = self.capacity,
            new_capacity,
            bytes = new_layout.size(),
            "grew buffer block"
        );

        self.ptr = Some(new_block);
        self.capacity = new_capacity;

        Ok(())
    }

    /// Sets the number of valid elements.
    ///
    /// # Safety
    ///
    /// `length` must not exceed the capacity and the first `length` elements must be initialized.
    #[inline]
    pub(crate) unsafe fn set_len(&mut self, length: usize) {
        debug_assert!(length <= self.capacity);
        self.length = length;
    }

    /// The valid elements, viewed as `T`.
    ///
    /// # Safety
    ///
    /// `T` must have the size and alignment of the header's element layout, and every valid
    /// element must be a valid `T`.
    #[inline]
    pub(crate) unsafe fn as_slice<T>(&self) -> &[T] {
        debug_assert_eq!(Layout::new::<T>(), self.element_layout);

        match self.ptr {
            // SAFETY: The block holds `length` initialized elements of this layout and lives as
            // long as the borrow of `self`. Forwarding the type requirement to the caller.
            Some(block) => unsafe { slice::from_raw_parts(block.as_ptr().cast::<T>(), self.length) },
            None => &[],
        }
    }

    /// The valid elements, viewed as mutable `T`.
    ///
    /// # Safety
    ///
    /// Same as [`as_slice()`][Self::as_slice].
    #[inline]
    pub(crate) unsafe fn as_mut_slice<T>(&mut self) -> &mut [T] {
        debug_assert_eq!(Layout::new::<T>(), self.element_layout);

        match self.ptr {
            // SAFETY: The block holds `length` initialized elements of this layout and we hold
            // an exclusive borrow of the header that owns it.
            Some(block) => unsafe {
                slice::from_raw_parts_mut(block.as_ptr().cast::<T>(), self.length)
            },
            None => &mut [],
        }
    }

    /// The whole block viewed as possibly uninitialized `T`, valid elements included.
    ///
    /// # Safety
    ///
    /// `T` must have the size and alignment of the header's element layout.
    #[inline]
    pub(crate) unsafe fn as_uninit_slice_mut<T>(&mut self) -> &mut [MaybeUninit<T>] {
        debug_assert_eq!(Layout::new::<T>(), self.element_layout);

        match self.ptr {
            // SAFETY: The block has room for `capacity` elements and `MaybeUninit` places no
            // requirement on their contents.
            Some(block) => unsafe {
                slice::from_raw_parts_mut(block.as_ptr().cast::<MaybeUninit<T>>(), self.capacity)
            },
            None => &mut [],
        }
    }

    /// The valid elements as raw bytes.
    ///
    /// # Safety
    ///
    /// Every byte of the valid elements must be initialized (no padding bytes).
    #[inline]
    pub(crate) unsafe fn as_bytes(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: The live region lies within the block and the caller guarantees its bytes
            // are initialized. Cannot overflow because the live elements fit in the block.
            Some(block) => unsafe {
                slice::from_raw_parts(
                    block.as_ptr(),
                    self.length.wrapping_mul(self.element_layout.size()),
                )
            },
            None => &[],
        }
    }

    /// The whole block as possibly uninitialized bytes.
    #[inline]
    pub(crate) fn as_uninit_bytes_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        match self.ptr {
            // SAFETY: The block spans `capacity * element size` bytes and we hold an exclusive
            // borrow of the header that owns it. Cannot overflow because the block exists.
            Some(block) => unsafe {
                slice::from_raw_parts_mut(
                    block.as_ptr().cast::<MaybeUninit<u8>>(),
                    self.capacity.wrapping_mul(self.element_layout.size()),
                )
            },
            None => &mut [],
        }
    }
}

impl<A: BlockAllocator> Drop for BufferHeader<A> {
    fn drop(&mut self) {
        let Some(block) = self.ptr.take() else {
            return;
        };

        let layout = block_layout(self.element_layout, self.capacity)
            .expect("the layout of an existing block is always valid");

        let allocator = self
            .allocator
            .as_ref()
            .expect("a header that owns a block always has an allocator");

        // SAFETY: The block was allocated by this allocator with this layout and is released
        // exactly once, here.
        unsafe {
            allocator.free(block, layout);
        }
    }
}

// SAFETY: The header exclusively owns its block and holds no thread-bound state, so it can be
// moved to another thread together with its allocator.
unsafe impl<A: BlockAllocator + Send> Send for BufferHeader<A> {}

/// Layout of a block holding `capacity` elements, or `None` if it cannot be represented.
fn block_layout(element_layout: Layout, capacity: usize) -> Option<Layout> {
    let size = element_layout.size().checked_mul(capacity)?;
    Layout::from_size_align(size, element_layout.align()).ok()
}

/// Minimum element count whose block covers at least one cache line.
#[expect(
    clippy::integer_division,
    reason = "we want the number of whole elements per cache line"
)]
fn cache_line_floor(element_layout: Layout) -> usize {
    (CACHE_LINE_SIZE / element_layout.size()).max(1)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::ptr::NonNull;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::testing::{CountingAllocator, RefusingAllocator};

    assert_impl_all!(BufferHeader: Send);
    assert_not_impl_any!(BufferHeader: Sync);

    fn push_u32(header: &mut BufferHeader<impl BlockAllocator>, value: u32) {
        let length = header.len();
        let spare = unsafe { header.as_uninit_slice_mut::<u32>() };
        spare[length].write(value);
        unsafe { header.set_len(length + 1) };
    }

    #[test]
    fn starts_empty() {
        let header = BufferHeader::new_in(Layout::new::<u32>(), Global);

        assert!(header.is_created());
        assert!(header.is_empty());
        assert_eq!(header.capacity(), 0);
        assert!(header.ptr.is_none());
    }

    #[test]
    fn growth_rounds_to_power_of_two() {
        let mut header = BufferHeader::new_in(Layout::new::<u32>(), Global);

        header.ensure_capacity(5).unwrap();
        assert_eq!(header.capacity(), 8);

        header.ensure_capacity(9).unwrap();
        assert_eq!(header.capacity(), 16);

        header.ensure_capacity(16).unwrap();
        assert_eq!(header.capacity(), 16);
    }

    #[test]
    fn ensure_capacity_within_capacity_keeps_block() {
        let mut header = BufferHeader::new_in(Layout::new::<u32>(), Global);
        header.ensure_capacity(4).unwrap();
        let block = header.ptr;

        header.ensure_capacity(3).unwrap();

        assert_eq!(header.ptr, block);
        assert_eq!(header.capacity(), 4);
    }

    #[test]
    fn full_buffer_grows_to_next_power_of_two_and_keeps_elements() {
        let mut header = BufferHeader::new_in(Layout::new::<u32>(), Global);
        header.ensure_capacity(8).unwrap();

        for value in 0..8 {
            push_u32(&mut header, value * 10);
        }

        assert_eq!(header.capacity(), 8);

        header.ensure_slack(1).unwrap();
        push_u32(&mut header, 80);

        assert_eq!(header.capacity(), 16);
        assert_eq!(
            unsafe { header.as_slice::<u32>() },
            &[0, 10, 20, 30, 40, 50, 60, 70, 80]
        );
    }

    #[test]
    fn growth_frees_old_block() {
        let allocator = CountingAllocator::default();
        let mut header = BufferHeader::new_in(Layout::new::<u64>(), &allocator);

        header.ensure_capacity(2).unwrap();
        assert_eq!(allocator.live_blocks(), 1);

        header.ensure_capacity(100).unwrap();
        assert_eq!(allocator.live_blocks(), 1);
        assert_eq!(allocator.allocations(), 2);

        drop(header);
        assert_eq!(allocator.live_blocks(), 0);
    }

    #[test]
    fn growth_copies_only_live_elements() {
        let allocator = CountingAllocator::default();
        let mut header = BufferHeader::new_in(Layout::new::<u32>(), &allocator);
        header.ensure_capacity(4).unwrap();
        push_u32(&mut header, 7);

        header.ensure_capacity(32).unwrap();

        assert_eq!(header.len(), 1);
        assert_eq!(unsafe { header.as_slice::<u32>() }, &[7]);
    }

    #[test]
    fn uncreated_cannot_grow() {
        let mut header = BufferHeader::<Global>::uncreated(Layout::new::<u32>());

        assert!(!header.is_created());
        assert_eq!(header.ensure_capacity(1), Err(Error::NotCreated));

        // Zero capacity is already satisfied.
        assert_eq!(header.ensure_capacity(0), Ok(()));
    }

    #[test]
    fn refused_allocation_leaves_header_unchanged() {
        let mut header = BufferHeader::new_in(Layout::new::<u32>(), RefusingAllocator);

        let result = header.ensure_capacity(10);

        assert_eq!(
            result,
            Err(Error::AllocationFailed {
                bytes: 64,
                alignment: 4
            })
        );
        assert_eq!(header.capacity(), 0);
        assert!(header.ptr.is_none());
    }

    #[test]
    fn unrepresentable_capacity_is_error() {
        let mut header = BufferHeader::new_in(Layout::new::<u64>(), Global);

        let result = header.ensure_capacity(usize::MAX);
        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));

        let result = header.ensure_capacity(usize::MAX / 4);
        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));

        assert_eq!(header.capacity(), 0);
    }

    #[test]
    fn slack_overflow_is_error() {
        let mut header = BufferHeader::new_in(Layout::new::<u8>(), Global);
        header.ensure_capacity(1).unwrap();
        unsafe {
            header.as_uninit_bytes_mut()[0].write(1);
            header.set_len(1);
        }

        let result = header.ensure_slack(usize::MAX);
        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
    }

    #[test]
    fn first_allocation_covers_cache_line() {
        let header = BufferHeader::with_capacity_in(Layout::new::<u32>(), 1, Global).unwrap();
        assert_eq!(header.capacity(), 16);

        let header = BufferHeader::with_capacity_in(Layout::new::<u8>(), 0, Global).unwrap();
        assert_eq!(header.capacity(), 64);

        let header = BufferHeader::with_capacity_in(Layout::new::<[u8; 100]>(), 3, Global).unwrap();
        assert_eq!(header.capacity(), 4);

        let header = BufferHeader::with_capacity_in(Layout::new::<u16>(), 33, Global).unwrap();
        assert_eq!(header.capacity(), 64);
    }

    #[test]
    fn block_is_aligned_to_element() {
        #[repr(C, align(32))]
        struct Wide {
            _data: [u8; 32],
        }

        let mut header = BufferHeader::new_in(Layout::new::<Wide>(), Global);
        header.ensure_capacity(3).unwrap();

        let block: NonNull<u8> = header.ptr.unwrap();
        assert_eq!(block.as_ptr().addr() % 32, 0);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut header = BufferHeader::new_in(Layout::new::<u32>(), Global);
        header.ensure_capacity(4).unwrap();
        push_u32(&mut header, 1);

        header.clear();

        assert!(header.is_empty());
        assert_eq!(header.capacity(), 4);
    }

    #[test]
    #[should_panic]
    fn zero_sized_element_panics() {
        drop(BufferHeader::new_in(Layout::new::<()>(), Global));
    }
}
