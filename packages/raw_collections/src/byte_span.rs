use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;

use xxhash_rust::xxh3::xxh3_64;

use crate::{BlockAllocator, Error, RawList, RawText, Result};

/// A read-only view over a borrowed range of bytes.
///
/// Equality, ordering and hashing are all based on the byte content, never on the address of
/// the bytes. The bytes are not required to be valid UTF-8.
///
/// The view is a pure projection: it has no operations that change its length, its capacity or
/// the bytes it refers to.
///
/// # Examples
///
/// ```
/// use raw_collections::ByteSpan;
///
/// let data = b"hello world";
/// let span = ByteSpan::new(data);
///
/// assert_eq!(span.slice(6, 100)?, ByteSpan::from("world"));
/// assert!(span.slice_from(12).is_err());
/// # Ok::<(), raw_collections::Error>(())
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteSpan<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteSpan<'a> {
    /// A view of zero bytes.
    pub const EMPTY: ByteSpan<'static> = ByteSpan { bytes: &[] };

    /// Creates a view over `bytes`.
    #[must_use]
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Number of bytes in the view.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the view has no bytes.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The bytes of the view.
    #[must_use]
    #[inline]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Returns the byte at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is not below the length.
    #[inline]
    pub fn get(&self, index: usize) -> Result<u8> {
        self.bytes
            .get(index)
            .copied()
            .ok_or(Error::IndexOutOfRange {
                index,
                length: self.len(),
            })
    }

    /// Returns a view of the bytes from `start` to the end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `start` is greater than the length.
    #[inline]
    pub fn slice_from(&self, start: usize) -> Result<Self> {
        self.bytes
            .get(start..)
            .map(Self::new)
            .ok_or(Error::IndexOutOfRange {
                index: start,
                length: self.len(),
            })
    }

    /// Returns a view of up to `length` bytes starting at `start`.
    ///
    /// The result is clamped so it never extends past the end of this view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `start` is greater than the length.
    #[inline]
    pub fn slice(&self, start: usize, length: usize) -> Result<Self> {
        let tail = self.slice_from(start)?;
        let clamped = length.min(tail.len());

        Ok(Self::new(tail.bytes.get(..clamped).unwrap_or_default()))
    }

    /// The 64-bit xxh3 hash of the content.
    #[must_use]
    #[inline]
    pub fn content_hash64(&self) -> u64 {
        xxh3_64(self.bytes)
    }

    /// The content hash folded to 32 bits by combining both halves of
    /// [`content_hash64()`][Self::content_hash64].
    #[must_use]
    #[inline]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "folding deliberately keeps only 32 bits of each half"
    )]
    pub fn content_hash(&self) -> u32 {
        let hash = self.content_hash64();

        (hash as u32) ^ ((hash >> 32) as u32)
    }
}

impl PartialEq for ByteSpan<'_> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }

        ptr::eq(self.bytes.as_ptr(), other.bytes.as_ptr()) || self.bytes == other.bytes
    }
}

impl Eq for ByteSpan<'_> {}

impl PartialOrd for ByteSpan<'_> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteSpan<'_> {
    /// Lexicographic byte order; of two views that share a common prefix, the shorter one
    /// sorts first.
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        if self.len() == other.len() && ptr::eq(self.bytes.as_ptr(), other.bytes.as_ptr()) {
            return Ordering::Equal;
        }

        self.bytes.cmp(other.bytes)
    }
}

impl Hash for ByteSpan<'_> {
    /// Feeds the folded [`content_hash()`][ByteSpan::content_hash] to the hasher. Every
    /// [`AsByteSpan`] key type hashes the same way.
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.content_hash());
    }
}

impl fmt::Display for ByteSpan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.bytes))
    }
}

impl AsRef<[u8]> for ByteSpan<'_> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.bytes
    }
}

impl<'a> From<&'a [u8]> for ByteSpan<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for ByteSpan<'a> {
    #[inline]
    fn from(bytes: &'a [u8; N]) -> Self {
        Self::new(bytes)
    }
}

impl<'a> From<&'a str> for ByteSpan<'a> {
    #[inline]
    fn from(value: &'a str) -> Self {
        Self::new(value.as_bytes())
    }
}

/// Types whose content can be viewed as a [`ByteSpan`].
///
/// String-like hash table keys implement this so that they can be looked up by byte content
/// with [`RawHashTable::find_normalized_string_key_index()`][crate::RawHashTable::find_normalized_string_key_index].
/// For that lookup to work, an implementing type's [`Hash`] implementation must produce the
/// same hasher input as hashing its byte span.
pub trait AsByteSpan {
    /// Whether the implementing type is [`ByteSpan`] itself.
    const IS_BYTE_SPAN: bool = false;

    /// Returns a view of the content bytes.
    fn as_byte_span(&self) -> ByteSpan<'_>;
}

impl AsByteSpan for ByteSpan<'_> {
    const IS_BYTE_SPAN: bool = true;

    #[inline]
    fn as_byte_span(&self) -> ByteSpan<'_> {
        *self
    }
}

impl AsByteSpan for [u8] {
    #[inline]
    fn as_byte_span(&self) -> ByteSpan<'_> {
        ByteSpan::new(self)
    }
}

impl AsByteSpan for str {
    #[inline]
    fn as_byte_span(&self) -> ByteSpan<'_> {
        ByteSpan::new(self.as_bytes())
    }
}

impl<A: BlockAllocator> AsByteSpan for RawList<u8, A> {
    #[inline]
    fn as_byte_span(&self) -> ByteSpan<'_> {
        ByteSpan::new(self.as_slice())
    }
}

impl<A: BlockAllocator> AsByteSpan for RawText<A> {
    #[inline]
    fn as_byte_span(&self) -> ByteSpan<'_> {
        ByteSpan::new(self.as_bytes())
    }
}
