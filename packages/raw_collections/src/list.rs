use std::alloc::Layout;
use std::marker::PhantomData;
use std::ptr;

use crate::{BlockAllocator, BufferHeader, Error, Global, Result};

/// A growable list of `Copy` elements over a [`BufferHeader`].
///
/// The list never runs destructors for its elements. The `_no_resize` operations require the
/// caller to have reserved capacity beforehand via [`ensure_capacity()`][Self::ensure_capacity]
/// or [`ensure_slack()`][Self::ensure_slack]; the plain operations grow on demand.
///
/// # Examples
///
/// ```
/// use raw_collections::{Global, RawList};
///
/// let mut list = RawList::<u32>::create(4, Global)?;
/// list.ensure_slack(2)?;
/// list.push_no_resize(1)?;
/// list.push_no_resize(2)?;
/// list.push(3)?;
///
/// assert_eq!(list.as_slice(), &[1, 2, 3]);
/// # Ok::<(), raw_collections::Error>(())
/// ```
#[derive(Debug)]
#[repr(C)]
pub struct RawList<T: Copy, A: BlockAllocator = Global> {
    header: BufferHeader<A>,
    _element: PhantomData<T>,
}

impl<T: Copy, A: BlockAllocator> RawList<T, A> {
    /// Creates an empty list with zero capacity.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn new_in(allocator: A) -> Self {
        Self {
            header: BufferHeader::new_in(Layout::new::<T>(), allocator),
            _element: PhantomData,
        }
    }

    /// Creates an empty list and allocates room for at least `capacity` elements.
    ///
    /// The capacity is floored to one cache line worth of elements and rounded up to a
    /// power of two.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] or [`Error::AllocationFailed`] if the block
    /// cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    pub fn create(capacity: usize, allocator: A) -> Result<Self> {
        Ok(Self {
            header: BufferHeader::with_capacity_in(Layout::new::<T>(), capacity, allocator)?,
            _element: PhantomData,
        })
    }

    /// The shared header of this list.
    #[must_use]
    #[inline]
    pub fn header(&self) -> &BufferHeader<A> {
        &self.header
    }

    /// Number of elements in the list.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len()
    }

    /// Whether the list has no elements.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    /// Number of elements the list can hold without growing.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.header.capacity()
    }

    /// Ensures the list can hold at least `capacity` elements.
    ///
    /// # Errors
    ///
    /// See [`BufferHeader::ensure_capacity()`].
    #[inline]
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        self.header.ensure_capacity(capacity)
    }

    /// Ensures the list can hold at least `slack` more elements.
    ///
    /// # Errors
    ///
    /// See [`BufferHeader::ensure_slack()`].
    #[inline]
    pub fn ensure_slack(&mut self, slack: usize) -> Result<()> {
        self.header.ensure_slack(slack)
    }

    /// Appends an element into already reserved capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCreated`] if the list has no allocator capability and
    /// [`Error::CapacityExceeded`] if the list is full.
    #[inline]
    pub fn push_no_resize(&mut self, value: T) -> Result<()> {
        let length = self.len();
        self.check_has_capacity(length.checked_add(1).unwrap_or(usize::MAX))?;

        // SAFETY: There is room for at least one more element, which is all we touch.
        unsafe {
            self.push_unchecked(value);
        }

        Ok(())
    }

    /// Appends an element into already reserved capacity without any checks.
    ///
    /// # Safety
    ///
    /// The list must have room for at least one more element.
    #[inline]
    pub unsafe fn push_unchecked(&mut self, value: T) {
        let length = self.len();

        // SAFETY: The layout of the header is the layout of T.
        let spare = unsafe { self.header.as_uninit_slice_mut::<T>() };

        // SAFETY: The caller guarantees that `length < capacity`.
        unsafe {
            spare.get_unchecked_mut(length).write(value);
        }

        // SAFETY: The element at `length` was initialized above. Cannot overflow because
        // the new length is still within the capacity.
        unsafe {
            self.header.set_len(length.wrapping_add(1));
        }
    }

    /// Appends an element, growing the list if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the list needed to grow and growth failed.
    #[inline]
    pub fn push(&mut self, value: T) -> Result<()> {
        self.ensure_slack(1)?;
        self.push_no_resize(value)
    }

    /// Appends all elements of a slice, growing the list if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the list needed to grow and growth failed.
    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<()> {
        self.ensure_slack(values.len())?;

        let length = self.len();

        // SAFETY: The layout of the header is the layout of T.
        let spare = unsafe { self.header.as_uninit_slice_mut::<T>() };

        // Cannot overflow because we just ensured the capacity.
        let target = spare
            .get_mut(length..length.wrapping_add(values.len()))
            .expect("capacity was ensured above");

        // SAFETY: The target range has exactly `values.len()` slots and does not overlap
        // `values`, which is borrowed immutably while we hold `&mut self`.
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), target.as_mut_ptr().cast::<T>(), values.len());
        }

        // SAFETY: All elements up to the new length are initialized.
        unsafe {
            self.header.set_len(length.wrapping_add(values.len()));
        }

        Ok(())
    }

    /// Returns the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is not below the length.
    #[inline]
    pub fn element_at(&self, index: usize) -> Result<&T> {
        let length = self.len();
        self.as_slice()
            .get(index)
            .ok_or(Error::IndexOutOfRange { index, length })
    }

    /// Returns a mutable reference to the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is not below the length.
    #[inline]
    pub fn element_at_mut(&mut self, index: usize) -> Result<&mut T> {
        let length = self.len();
        self.as_mut_slice()
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, length })
    }

    /// The elements of the list.
    #[must_use]
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: The layout of the header is the layout of T and all live elements were
        // written as T.
        unsafe { self.header.as_slice::<T>() }
    }

    /// The elements of the list, mutably.
    #[must_use]
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: The layout of the header is the layout of T and all live elements were
        // written as T.
        unsafe { self.header.as_mut_slice::<T>() }
    }

    /// Removes all elements, keeping the capacity.
    #[inline]
    pub fn clear(&mut self) {
        self.header.clear();
    }

    /// Shortens the list to `length` elements. Does nothing if the list is already shorter.
    #[inline]
    pub fn truncate(&mut self, length: usize) {
        if length < self.len() {
            // SAFETY: A prefix of initialized elements is initialized.
            unsafe {
                self.header.set_len(length);
            }
        }
    }

    /// Sets the length, zero-filling any newly exposed elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if `length` exceeds the capacity.
    pub(crate) fn resize_zeroed(&mut self, length: usize) -> Result<()>
    where
        T: bytemuck::Zeroable,
    {
        self.check_has_capacity(length)?;

        let old_length = self.len();

        if length > old_length {
            // SAFETY: The layout of the header is the layout of T.
            let spare = unsafe { self.header.as_uninit_slice_mut::<T>() };

            for slot in spare.get_mut(old_length..length).unwrap_or_default() {
                slot.write(T::zeroed());
            }
        }

        // SAFETY: Elements below `old_length` were already initialized and the rest were
        // zero-filled above, which is a valid T.
        unsafe {
            self.header.set_len(length);
        }

        Ok(())
    }

    fn check_has_capacity(&self, required: usize) -> Result<()> {
        if !self.header.is_created() {
            return Err(Error::NotCreated);
        }

        if required > self.capacity() {
            return Err(Error::CapacityExceeded {
                requested: required,
                available: self.capacity(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::testing::CountingAllocator;

    assert_impl_all!(RawList<u64>: Send);
    assert_not_impl_any!(RawList<u64>: Sync);

    #[test]
    fn create_applies_cache_line_floor() {
        let list = RawList::<u64>::create(1, Global).unwrap();

        assert_eq!(list.capacity(), 8);
        assert!(list.is_empty());
    }

    #[test]
    fn push_no_resize_needs_reserved_capacity() {
        let mut list = RawList::<u32>::new_in(Global);

        assert_eq!(
            list.push_no_resize(1),
            Err(Error::CapacityExceeded {
                requested: 1,
                available: 0
            })
        );

        list.ensure_slack(1).unwrap();
        list.push_no_resize(1).unwrap();

        assert_eq!(list.as_slice(), &[1]);
    }

    #[test]
    fn push_grows_and_preserves() {
        let allocator = CountingAllocator::default();
        let mut list = RawList::<u16, _>::new_in(&allocator);

        for value in 0..100 {
            list.push(value).unwrap();
        }

        assert_eq!(list.len(), 100);
        assert_eq!(list.capacity(), 128);
        assert!(list.as_slice().iter().copied().eq(0..100));
        assert_eq!(allocator.live_blocks(), 1);
    }

    #[test]
    fn extend_from_slice_appends() {
        let mut list = RawList::<u8>::new_in(Global);
        list.extend_from_slice(b"abc").unwrap();
        list.extend_from_slice(b"").unwrap();
        list.extend_from_slice(b"de").unwrap();

        assert_eq!(list.as_slice(), b"abcde");
    }

    #[test]
    fn element_access_is_bounds_checked() {
        let mut list = RawList::<i32>::new_in(Global);
        list.push(5).unwrap();

        *list.element_at_mut(0).unwrap() += 1;

        assert_eq!(*list.element_at(0).unwrap(), 6);
        assert_eq!(
            list.element_at(1),
            Err(Error::IndexOutOfRange {
                index: 1,
                length: 1
            })
        );
    }

    #[test]
    fn truncate_and_clear() {
        let mut list = RawList::<u32>::new_in(Global);
        list.extend_from_slice(&[1, 2, 3]).unwrap();

        list.truncate(5);
        assert_eq!(list.len(), 3);

        list.truncate(1);
        assert_eq!(list.as_slice(), &[1]);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.capacity(), 4);
    }

    #[test]
    fn resize_zeroed_fills_new_elements() {
        let mut list = RawList::<u32>::new_in(Global);
        list.ensure_capacity(4).unwrap();
        list.push_no_resize(9).unwrap();

        list.resize_zeroed(3).unwrap();
        assert_eq!(list.as_slice(), &[9, 0, 0]);

        assert!(list.resize_zeroed(5).is_err());
    }

    #[test]
    fn header_is_first_field() {
        let list = RawList::<u32>::new_in(Global);

        let list_address = (&raw const list).addr();
        let header_address = (&raw const *list.header()).addr();

        assert_eq!(list_address, header_address);
    }
}
