use std::mem::size_of;

use bytemuck::AnyBitPattern;

use crate::{AppendBuffer, BlockAllocator, Error, Result};

/// A forward cursor over bytes produced by an [`AppendBuffer`].
///
/// The reader borrows the bytes it reads, so the buffer cannot be modified while a reader over
/// it exists. Values are read unaligned in native byte order, the same way the buffer writes
/// them.
///
/// Every movement is bounds-checked against the borrowed bytes. A movement that would leave
/// `[0, size]` fails with [`Error::OutOfBounds`] and leaves the offset unchanged.
#[derive(Clone, Copy, Debug)]
pub struct AppendBufferReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> AppendBufferReader<'a> {
    /// Creates a reader positioned at the start of `bytes`.
    #[must_use]
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Current read position.
    #[must_use]
    #[inline]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Total number of readable bytes.
    #[must_use]
    #[inline]
    pub const fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Number of bytes between the offset and the end.
    #[must_use]
    #[inline]
    pub const fn remaining(&self) -> usize {
        // Cannot underflow because the offset never moves past the end.
        self.bytes.len().wrapping_sub(self.offset)
    }

    /// Whether the offset is at the end of the bytes.
    #[must_use]
    #[inline]
    pub const fn is_at_end(&self) -> bool {
        self.offset == self.bytes.len()
    }

    /// Moves the offset back to the start.
    #[inline]
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Reads the next value and advances past it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
    #[inline]
    pub fn read_next<T: AnyBitPattern>(&mut self) -> Result<T> {
        let bytes = self.read_next_bytes(size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Reads the next value and advances past it, or returns `None` without moving if fewer
    /// than `size_of::<T>()` bytes remain.
    #[must_use]
    #[inline]
    pub fn try_read_next<T: AnyBitPattern>(&mut self) -> Option<T> {
        self.read_next().ok()
    }

    /// Reads the next value without advancing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
    #[inline]
    pub fn peek<T: AnyBitPattern>(&self) -> Result<T> {
        let mut lookahead = *self;
        lookahead.read_next()
    }

    /// Returns the next `count` bytes and advances past them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer than `count` bytes remain.
    pub fn read_next_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self.forward_target(count)?;

        let bytes = self
            .bytes
            .get(self.offset..end)
            .expect("range was validated against the size above");

        self.offset = end;
        Ok(bytes)
    }

    /// Advances the offset by `count` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer than `count` bytes remain.
    #[inline]
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.offset = self.forward_target(count)?;
        Ok(())
    }

    /// Advances the offset by the size of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
    #[inline]
    pub fn skip_of<T>(&mut self) -> Result<()> {
        self.skip(size_of::<T>())
    }

    /// Moves the offset back by `count` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the offset is less than `count`.
    #[inline]
    pub fn backup(&mut self, count: usize) -> Result<()> {
        self.offset = self
            .offset
            .checked_sub(count)
            .ok_or(Error::OutOfBounds {
                offset: self.offset,
                delta: 0_isize.saturating_sub_unsigned(count),
                size: self.size(),
            })?;

        Ok(())
    }

    /// Moves the offset back by the size of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the offset is less than `size_of::<T>()`.
    #[inline]
    pub fn backup_of<T>(&mut self) -> Result<()> {
        self.backup(size_of::<T>())
    }

    /// Copies the next value into `destination` without reinterpreting it and advances past it.
    ///
    /// # Errors
    ///
    /// Same as [`read_add_to_no_resize_bytes()`][Self::read_add_to_no_resize_bytes] with
    /// `count = size_of::<T>()`.
    #[inline]
    pub fn read_add_to_no_resize<T, A: BlockAllocator>(
        &mut self,
        destination: &mut AppendBuffer<A>,
    ) -> Result<()> {
        self.read_add_to_no_resize_bytes(destination, size_of::<T>())
    }

    /// Copies the next `count` bytes into reserved capacity of `destination` and advances past
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer than `count` bytes remain, and
    /// [`Error::NotCreated`] or [`Error::CapacityExceeded`] if `destination` lacks the room.
    /// Neither the reader nor the destination change on error.
    pub fn read_add_to_no_resize_bytes<A: BlockAllocator>(
        &mut self,
        destination: &mut AppendBuffer<A>,
        count: usize,
    ) -> Result<()> {
        let end = self.forward_target(count)?;

        destination.check_has_room(destination.len().checked_add(count).unwrap_or(usize::MAX))?;

        let bytes = self
            .bytes
            .get(self.offset..end)
            .expect("range was validated against the size above");

        destination.add_bytes_no_resize(bytes)?;
        self.offset = end;

        Ok(())
    }

    /// Copies the next value into `destination` and advances past it, without checking either
    /// side.
    ///
    /// # Safety
    ///
    /// At least `size_of::<T>()` bytes must remain in the reader. `destination` must have been
    /// created and must have at least `size_of::<T>()` bytes of reserved capacity beyond its
    /// length.
    #[inline]
    pub unsafe fn read_add_to_no_resize_unchecked<T, A: BlockAllocator>(
        &mut self,
        destination: &mut AppendBuffer<A>,
    ) {
        // Cannot overflow because the caller guarantees the bytes remain.
        let end = self.offset.wrapping_add(size_of::<T>());

        // SAFETY: The caller guarantees `offset..end` lies within the bytes.
        let bytes = unsafe { self.bytes.get_unchecked(self.offset..end) };

        // SAFETY: The caller guarantees the destination has room.
        unsafe {
            destination.add_bytes_unchecked(bytes);
        }

        self.offset = end;
    }

    /// Offset after moving forward by `count` bytes, if that stays within the bytes.
    fn forward_target(&self, count: usize) -> Result<usize> {
        self.offset
            .checked_add(count)
            .filter(|end| *end <= self.size())
            .ok_or(Error::OutOfBounds {
                offset: self.offset,
                delta: 0_isize.saturating_add_unsigned(count),
                size: self.size(),
            })
    }
}
