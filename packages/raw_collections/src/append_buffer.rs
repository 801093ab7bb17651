use std::alloc::Layout;
use std::mem::{MaybeUninit, size_of};
use std::ptr;

use bytemuck::NoUninit;

use crate::{
    AppendBufferReader, AsByteSpan, BlockAllocator, BufferHeader, ByteSpan, Error, Global, Result,
};

/// An append-only byte buffer for serializing fixed-size values and raw byte ranges.
///
/// Values are stored unaligned, back to back, in native byte order. The block itself is aligned
/// to the alignment given at creation.
///
/// Writes come in two flavors:
///
/// * The `_no_resize` family writes into capacity reserved beforehand with
///   [`ensure_slack()`][Self::ensure_slack] and fails if there is not enough room.
/// * [`add()`][Self::add] and [`add_bytes()`][Self::add_bytes] grow the buffer as needed.
///
/// [`overwrite()`][Self::overwrite] patches bytes that were already written, for example a
/// length prefix that is only known after the payload has been appended.
///
/// # Examples
///
/// ```
/// use raw_collections::{AppendBuffer, Global};
///
/// let mut buffer = AppendBuffer::new_in(8, Global);
///
/// buffer.ensure_slack(4)?;
/// buffer.add_no_resize(0_u32)?; // Placeholder for the payload length.
/// buffer.add_bytes(b"payload")?;
/// buffer.overwrite(0, 7_u32)?;
///
/// let mut reader = buffer.reader();
/// let length = reader.read_next::<u32>()?;
/// assert_eq!(reader.read_next_bytes(length as usize)?, b"payload");
/// assert!(reader.is_at_end());
/// # Ok::<(), raw_collections::Error>(())
/// ```
#[derive(Debug)]
#[repr(C)]
pub struct AppendBuffer<A: BlockAllocator = Global> {
    header: BufferHeader<A>,
}

impl<A: BlockAllocator> AppendBuffer<A> {
    /// Creates an empty buffer with zero capacity whose block will be aligned to `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    #[must_use]
    pub fn new_in(alignment: usize, allocator: A) -> Self {
        Self {
            header: BufferHeader::new_in(byte_layout(alignment), allocator),
        }
    }

    /// Creates an empty buffer with room for at least `capacity` bytes.
    ///
    /// The capacity is floored to one cache line and rounded up to a power of two.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn create(capacity: usize, alignment: usize, allocator: A) -> Result<Self> {
        Ok(Self {
            header: BufferHeader::with_capacity_in(byte_layout(alignment), capacity, allocator)?,
        })
    }

    /// Creates a buffer without an allocator capability. Every write fails with
    /// [`Error::NotCreated`].
    #[must_use]
    pub const fn uncreated() -> Self {
        Self {
            header: BufferHeader::uncreated(byte_layout_const()),
        }
    }

    /// The shared header of this buffer.
    #[must_use]
    #[inline]
    pub fn header(&self) -> &BufferHeader<A> {
        &self.header
    }

    /// Whether the buffer was created with an allocator capability.
    #[must_use]
    #[inline]
    pub fn is_created(&self) -> bool {
        self.header.is_created()
    }

    /// Number of bytes written.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len()
    }

    /// Whether no bytes have been written.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    /// Number of bytes the buffer can hold without growing.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.header.capacity()
    }

    /// Alignment of the buffer's block.
    #[must_use]
    #[inline]
    pub fn alignment(&self) -> usize {
        self.header.element_layout().align()
    }

    /// Ensures the buffer can hold at least `capacity` bytes.
    ///
    /// # Errors
    ///
    /// See [`BufferHeader::ensure_capacity()`].
    #[inline]
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        self.header.ensure_capacity(capacity)
    }

    /// Ensures the buffer can hold at least `slack` more bytes.
    ///
    /// # Errors
    ///
    /// See [`BufferHeader::ensure_slack()`].
    #[inline]
    pub fn ensure_slack(&mut self, slack: usize) -> Result<()> {
        self.header.ensure_slack(slack)
    }

    /// Appends the bytes of `value` into reserved capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCreated`] if the buffer has no allocator capability and
    /// [`Error::CapacityExceeded`] if fewer than `size_of::<T>()` bytes are reserved.
    #[inline]
    pub fn add_no_resize<T: NoUninit>(&mut self, value: T) -> Result<()> {
        self.add_bytes_no_resize(bytemuck::bytes_of(&value))
    }

    /// Appends the bytes of two values back to back into reserved capacity.
    ///
    /// # Errors
    ///
    /// Same as [`add_no_resize()`][Self::add_no_resize], checked against the combined size.
    /// Nothing is written on error.
    pub fn add_pair_no_resize<T0: NoUninit, T1: NoUninit>(
        &mut self,
        value0: T0,
        value1: T1,
    ) -> Result<()> {
        let old_length = self.len();
        let new_length = old_length
            .checked_add(size_of::<T0>())
            .and_then(|length| length.checked_add(size_of::<T1>()))
            .unwrap_or(usize::MAX);

        self.check_has_room(new_length)?;

        self.write_at(old_length, bytemuck::bytes_of(&value0));
        // Cannot overflow because the combined size was validated above.
        self.write_at(
            old_length.wrapping_add(size_of::<T0>()),
            bytemuck::bytes_of(&value1),
        );

        // SAFETY: Every byte up to the new length has been written.
        unsafe {
            self.header.set_len(new_length);
        }

        Ok(())
    }

    /// Appends raw bytes into reserved capacity.
    ///
    /// # Errors
    ///
    /// Same as [`add_no_resize()`][Self::add_no_resize].
    pub fn add_bytes_no_resize(&mut self, bytes: &[u8]) -> Result<()> {
        let old_length = self.len();
        let new_length = old_length.checked_add(bytes.len()).unwrap_or(usize::MAX);

        self.check_has_room(new_length)?;

        self.write_at(old_length, bytes);

        // SAFETY: Every byte up to the new length has been written.
        unsafe {
            self.header.set_len(new_length);
        }

        Ok(())
    }

    /// Appends the bytes of `value` without checking for room.
    ///
    /// # Safety
    ///
    /// The buffer must have been created and must have at least `size_of::<T>()` bytes of
    /// reserved capacity beyond its length.
    #[inline]
    pub unsafe fn add_unchecked<T: NoUninit>(&mut self, value: T) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            self.add_bytes_unchecked(bytemuck::bytes_of(&value));
        }
    }

    /// Appends raw bytes without checking for room.
    ///
    /// # Safety
    ///
    /// The buffer must have been created and must have at least `bytes.len()` bytes of
    /// reserved capacity beyond its length.
    pub(crate) unsafe fn add_bytes_unchecked(&mut self, bytes: &[u8]) {
        let old_length = self.len();

        // SAFETY: The caller guarantees there is room. The source cannot overlap the block
        // because we hold an exclusive borrow of it.
        unsafe {
            let target = self.header.as_uninit_bytes_mut().as_mut_ptr().add(old_length);
            ptr::copy_nonoverlapping(bytes.as_ptr(), target.cast::<u8>(), bytes.len());
        }

        // SAFETY: The appended bytes were written above. Cannot overflow as the caller
        // guarantees the bytes fit in the capacity.
        unsafe {
            self.header.set_len(old_length.wrapping_add(bytes.len()));
        }
    }

    /// Appends the bytes of `value`, growing the buffer if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed. Nothing is written in that case.
    #[inline]
    pub fn add<T: NoUninit>(&mut self, value: T) -> Result<()> {
        self.ensure_slack(size_of::<T>())?;
        self.add_no_resize(value)
    }

    /// Appends raw bytes, growing the buffer if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed. Nothing is written in that case.
    #[inline]
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_slack(bytes.len())?;
        self.add_bytes_no_resize(bytes)
    }

    /// Overwrites already written bytes at `offset` with the bytes of `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `[offset, offset + size_of::<T>())` is not within the
    /// written bytes.
    #[inline]
    pub fn overwrite<T: NoUninit>(&mut self, offset: usize, value: T) -> Result<()> {
        self.overwrite_bytes(offset, bytemuck::bytes_of(&value))
    }

    /// Overwrites already written bytes at `offset` with `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `[offset, offset + bytes.len())` is not within the
    /// written bytes.
    pub fn overwrite_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let in_bounds = offset
            .checked_add(bytes.len())
            .is_some_and(|end| end <= self.len());

        if !in_bounds {
            return Err(Error::OutOfBounds {
                offset,
                delta: 0_isize.saturating_add_unsigned(bytes.len()),
                size: self.len(),
            });
        }

        self.write_at(offset, bytes);
        Ok(())
    }

    /// The written bytes.
    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: Every byte below the length was written by one of the add operations.
        unsafe { self.header.as_bytes() }
    }

    /// Returns a reader positioned at the start of the written bytes.
    #[must_use]
    #[inline]
    pub fn reader(&self) -> AppendBufferReader<'_> {
        AppendBufferReader::new(self.as_bytes())
    }

    /// Discards all written bytes, keeping the capacity.
    #[inline]
    pub fn clear(&mut self) {
        self.header.clear();
    }

    /// Verifies that the buffer was created and can hold `required` bytes.
    pub(crate) fn check_has_room(&self, required: usize) -> Result<()> {
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

    /// Copies `bytes` into the block at `offset`. The range must lie within the capacity.
    fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset
            .checked_add(bytes.len())
            .expect("caller validated the range against the capacity");

        let target: &mut [MaybeUninit<u8>] = self
            .header
            .as_uninit_bytes_mut()
            .get_mut(offset..end)
            .expect("caller validated the range against the capacity");

        // SAFETY: The target range has exactly `bytes.len()` bytes and cannot overlap `bytes`
        // because we hold an exclusive borrow of the block.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), target.as_mut_ptr().cast::<u8>(), bytes.len());
        }
    }
}

impl<A: BlockAllocator> AsByteSpan for AppendBuffer<A> {
    #[inline]
    fn as_byte_span(&self) -> ByteSpan<'_> {
        ByteSpan::new(self.as_bytes())
    }
}

fn byte_layout(alignment: usize) -> Layout {
    Layout::from_size_align(1, alignment).expect("alignment must be a power of two")
}

const fn byte_layout_const() -> Layout {
    Layout::new::<u8>()
}
