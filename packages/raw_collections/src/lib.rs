#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Growable buffers over raw memory blocks, append-only byte cursors, read-only byte views and
//! a separately chained hash table with free-list slot reuse.
//!
//! Every growable structure in this crate is built on [`BufferHeader`], which owns one
//! contiguous block obtained from a [`BlockAllocator`] and grows it to the next power of two
//! when more room is needed. The typed containers embed the header as their first field:
//!
//! * [`RawList<T>`] - a list of `Copy` elements.
//! * [`RawText`] - a byte string that always keeps a NUL terminator.
//! * [`AppendBuffer`] - an aligned byte buffer for serializing fixed-size values, read back with
//!   an [`AppendBufferReader`].
//!
//! [`RawHashTable`] builds its key, link, value and bucket arrays from the same parts. Keys are
//! any fixed-size `Copy + Eq + Hash` type. String-like keys such as [`FixedBytes`] can also be
//! found by byte content through [`ByteSpan`].
//!
//! # Capacity discipline
//!
//! Operations with a `_no_resize` suffix never allocate. They require room reserved beforehand
//! with `ensure_capacity()` or `ensure_slack()` and return an error if it is missing. The
//! corresponding operations without the suffix grow on demand. Any failed operation leaves the
//! structure unchanged.
//!
//! Growing replaces the memory block. Slices and references obtained earlier are invalidated,
//! which the borrow checker enforces because every growing operation takes `&mut self`.
//!
//! # Examples
//!
//! ```rust
//! use raw_collections::{AppendBuffer, Global, RawHashTable};
//!
//! // Serialize a length-prefixed record.
//! let mut buffer = AppendBuffer::new_in(8, Global);
//! buffer.add(0_u32)?;
//! buffer.add_bytes(b"hello")?;
//! buffer.overwrite(0, 5_u32)?;
//!
//! let mut reader = buffer.reader();
//! let length = reader.read_next::<u32>()?;
//! assert_eq!(length, 5);
//!
//! // Index something by key, reusing slots after removal.
//! let mut table = RawHashTable::<u32>::with_capacity(8)?;
//! let slot = table.add_unchecked_no_resize(10)?;
//! table.remove(&10);
//! assert_eq!(table.add_unchecked_no_resize(11)?, slot);
//! # Ok::<(), raw_collections::Error>(())
//! ```
//!
//! # Thread safety
//!
//! All owning types are thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). [`ByteSpan`]
//! and [`FixedBytes`] are plain values and are both.
//!
//! # Integrity checks
//!
//! With debug assertions enabled, the hash table checks its slot counters after every mutation.
//! The `integrity_checks` feature additionally walks every chain and the free list after every
//! mutation, in any build, and panics if they are inconsistent. The walk is linear in the table
//! size, so it is meant for testing rather than production use.

mod allocator;
mod append_buffer;
mod builder;
mod byte_span;
mod error;
mod fixed_bytes;
mod hash_table;
mod header;
mod list;
mod reader;
mod text;

#[cfg(test)]
mod testing;

pub use allocator::*;
pub use append_buffer::*;
pub use builder::*;
pub use byte_span::*;
pub use error::*;
pub use fixed_bytes::*;
pub use hash_table::*;
pub use header::*;
pub use list::*;
pub use reader::*;
pub use text::*;
