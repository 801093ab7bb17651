use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{AsByteSpan, ByteSpan, Error, Result};

/// A byte string of up to `N` bytes stored inline, making it a fixed-size `Copy` value.
///
/// This is the shape of a string-like hash table key: the table stores it like any other
/// fixed-size key, while equality and hashing follow the byte content so it can be found with
/// [`RawHashTable::find_normalized_string_key_index()`][crate::RawHashTable::find_normalized_string_key_index].
///
/// # Examples
///
/// ```
/// use raw_collections::{AsByteSpan, ByteSpan, FixedBytes};
///
/// let name = FixedBytes::<16>::try_from("alpha")?;
///
/// assert_eq!(name.len(), 5);
/// assert_eq!(name.as_byte_span(), ByteSpan::from("alpha"));
/// assert!(FixedBytes::<4>::try_from("too long").is_err());
/// # Ok::<(), raw_collections::Error>(())
/// ```
#[derive(Clone, Copy)]
pub struct FixedBytes<const N: usize> {
    /// Bytes past `length` are always zero.
    bytes: [u8; N],
    length: usize,
}

impl<const N: usize> FixedBytes<N> {
    /// Creates an empty value.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0; N],
            length: 0,
        }
    }

    /// Creates a value holding a copy of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if `source` is longer than `N` bytes.
    pub fn try_from_bytes(source: &[u8]) -> Result<Self> {
        let mut result = Self::new();
        result.try_extend(source)?;
        Ok(result)
    }

    /// Maximum number of bytes the value can hold.
    #[must_use]
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of bytes held.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Whether no bytes are held.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The bytes held.
    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.get(..self.length).unwrap_or_default()
    }

    /// Appends `source` to the held bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the result would exceed `N` bytes. The value is
    /// unchanged in that case.
    pub fn try_extend(&mut self, source: &[u8]) -> Result<()> {
        let new_length = self
            .length
            .checked_add(source.len())
            .filter(|new_length| *new_length <= N)
            .ok_or(Error::CapacityExceeded {
                requested: self.length.saturating_add(source.len()),
                available: N,
            })?;

        self.bytes
            .get_mut(self.length..new_length)
            .expect("range was validated against the capacity above")
            .copy_from_slice(source);
        self.length = new_length;

        Ok(())
    }

    /// Removes all bytes.
    pub fn clear(&mut self) {
        self.bytes = [0; N];
        self.length = 0;
    }
}

impl<const N: usize> Default for FixedBytes<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AsByteSpan for FixedBytes<N> {
    #[inline]
    fn as_byte_span(&self) -> ByteSpan<'_> {
        ByteSpan::new(self.as_bytes())
    }
}

impl<const N: usize> PartialEq for FixedBytes<N> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_byte_span() == other.as_byte_span()
    }
}

impl<const N: usize> Eq for FixedBytes<N> {}

impl<const N: usize> PartialOrd for FixedBytes<N> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const N: usize> Ord for FixedBytes<N> {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_byte_span().cmp(&other.as_byte_span())
    }
}

impl<const N: usize> Hash for FixedBytes<N> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_byte_span().hash(state);
    }
}

impl<const N: usize> TryFrom<&str> for FixedBytes<N> {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::try_from_bytes(value.as_bytes())
    }
}

impl<const N: usize> TryFrom<&[u8]> for FixedBytes<N> {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        Self::try_from_bytes(value)
    }
}

impl<const N: usize> fmt::Debug for FixedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBytes")
            .field("capacity", &N)
            .field("content", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

impl<const N: usize> fmt::Display for FixedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_byte_span(), f)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::hash::BuildHasher;

    use foldhash::fast::FixedState;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FixedBytes<8>: Send, Sync, Copy, Eq, Hash, Default);

    #[test]
    fn holds_up_to_capacity() {
        let full = FixedBytes::<4>::try_from("abcd").unwrap();
        assert_eq!(full.len(), 4);
        assert_eq!(full.capacity(), 4);

        assert_eq!(
            FixedBytes::<4>::try_from("abcde"),
            Err(Error::CapacityExceeded {
                requested: 5,
                available: 4
            })
        );
    }

    #[test]
    fn try_extend_is_all_or_nothing() {
        let mut value = FixedBytes::<5>::try_from("abc").unwrap();

        assert!(value.try_extend(b"def").is_err());
        assert_eq!(value.as_bytes(), b"abc");

        value.try_extend(b"de").unwrap();
        assert_eq!(value.as_bytes(), b"abcde");
    }

    #[test]
    fn hash_matches_byte_span() {
        let state = FixedState::default();
        let value = FixedBytes::<32>::try_from("hash me").unwrap();

        assert_eq!(
            state.hash_one(value),
            state.hash_one(ByteSpan::from("hash me"))
        );
    }

    #[test]
    fn equality_ignores_capacity_tail() {
        let mut a = FixedBytes::<8>::try_from("abcdef").unwrap();
        a.clear();
        a.try_extend(b"ab").unwrap();

        let b = FixedBytes::<8>::try_from("ab").unwrap();

        assert_eq!(a, b);
        assert!(a.cmp(&b).is_eq());
    }

    #[test]
    fn display_and_debug() {
        let value = FixedBytes::<8>::try_from("name").unwrap();

        assert_eq!(value.to_string(), "name");
        assert!(format!("{value:?}").contains("name"));
    }
}
