use std::{fmt, str};

use crate::{BlockAllocator, Global, RawList, Result};

/// A growable byte string that always keeps a NUL terminator after its content.
///
/// The terminator is stored in the underlying [`RawList<u8>`] but is not counted in
/// [`len()`][Self::len] or [`capacity()`][Self::capacity]. Content is not required to be
/// valid UTF-8 because [`try_resize()`][Self::try_resize] can cut it at any byte.
#[derive(Debug)]
#[repr(C)]
pub struct RawText<A: BlockAllocator = Global> {
    bytes: RawList<u8, A>,
}

impl<A: BlockAllocator> RawText<A> {
    /// Creates an empty text with room for at least `capacity` content bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be allocated.
    pub fn create(capacity: usize, allocator: A) -> Result<Self> {
        let mut bytes = RawList::create(capacity.saturating_add(1), allocator)?;
        bytes.push_no_resize(0)?;

        Ok(Self { bytes })
    }

    /// Creates a text holding a copy of `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be allocated.
    pub fn from_str_in(value: &str, allocator: A) -> Result<Self> {
        let mut text = Self::create(value.len(), allocator)?;
        text.push_str(value)?;
        Ok(text)
    }

    /// The underlying byte list, including the terminator.
    #[must_use]
    #[inline]
    pub fn as_raw_list(&self) -> &RawList<u8, A> {
        &self.bytes
    }

    /// Number of content bytes.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len().saturating_sub(1)
    }

    /// Whether there are no content bytes.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of content bytes the text can hold without growing.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.capacity().saturating_sub(1)
    }

    /// Ensures room for at least `capacity` content bytes plus the terminator.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed.
    #[inline]
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        self.bytes.ensure_capacity(capacity.saturating_add(1))
    }

    /// Ensures room for at least `slack` more content bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed.
    #[inline]
    pub fn ensure_slack(&mut self, slack: usize) -> Result<()> {
        self.ensure_capacity(self.len().saturating_add(slack))
    }

    /// Appends `value`, growing if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed. The text is unchanged in that case.
    pub fn push_str(&mut self, value: &str) -> Result<()> {
        self.ensure_slack(value.len())?;

        let length = self.len();
        self.bytes.truncate(length);
        self.bytes.extend_from_slice(value.as_bytes())?;
        self.bytes.push_no_resize(0)
    }

    /// Sets the content length, growing if needed. New content bytes are zero.
    ///
    /// # Errors
    ///
    /// Returns an error if growth failed. The text is unchanged in that case.
    pub fn try_resize(&mut self, length: usize) -> Result<()> {
        self.ensure_capacity(length)?;

        self.bytes.truncate(length);
        self.bytes.resize_zeroed(length.saturating_add(1))
    }

    /// Removes all content, keeping the capacity.
    pub fn clear(&mut self) {
        self.bytes.truncate(0);
        self.bytes
            .push_no_resize(0)
            .expect("the terminator slot is always reserved");
    }

    /// The content bytes, without the terminator.
    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let length = self.len();
        self.bytes.as_slice().get(..length).unwrap_or_default()
    }

    /// The content bytes followed by the terminator.
    #[must_use]
    #[inline]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// The content as a string slice, or `None` if it is not valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        str::from_utf8(self.as_bytes()).ok()
    }
}

impl<A: BlockAllocator> fmt::Display for RawText<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}
