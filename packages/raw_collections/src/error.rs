use thiserror::Error;

/// Errors that can occur when operating on raw buffers, cursors, byte views and hash tables.
///
/// Every failed operation leaves the target structure exactly as it was before the call.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A length or capacity larger than the structure can hold was requested.
    #[error("capacity exceeded: requested {requested}, available {available}")]
    CapacityExceeded {
        /// The requested length or capacity, in elements (bytes for byte buffers).
        requested: usize,

        /// The capacity that is available, in the same unit as `requested`.
        available: usize,
    },

    /// The allocator capability could not provide a memory block of the requested shape.
    #[error("allocation of {bytes} bytes aligned to {alignment} failed")]
    AllocationFailed {
        /// Size of the requested block in bytes.
        bytes: usize,

        /// Alignment of the requested block in bytes.
        alignment: usize,
    },

    /// A hash table slot id fell outside `[0, capacity)`.
    #[error("slot {slot} is outside the table capacity {capacity}")]
    SlotOutOfRange {
        /// The offending slot id.
        slot: usize,

        /// The slot capacity of the table.
        capacity: usize,
    },

    /// A cursor movement or byte range access would leave `[0, size]`.
    #[error(
        "requested range outside bounds: offset {offset}, delta {delta}, size {size}"
    )]
    OutOfBounds {
        /// Cursor offset or range start before the operation.
        offset: usize,

        /// Requested movement in bytes. Negative for backwards movement.
        delta: isize,

        /// Size of the region the cursor or range must stay within.
        size: usize,
    },

    /// An element index was not in `[0, length)`.
    #[error("index {index} is out of range for length {length}")]
    IndexOutOfRange {
        /// The offending index.
        index: usize,

        /// Number of valid elements.
        length: usize,
    },

    /// A hash table slot id refers to a slot that is on the free list.
    #[error("slot {slot} is not occupied")]
    VacantSlot {
        /// The offending slot id.
        slot: usize,
    },

    /// The structure was never created with an allocator capability.
    #[error("the structure has not been created")]
    NotCreated,

    /// A typed value access used a type whose size differs from the table's value record size.
    #[error("invalid value size: {actual} ({expected} expected)")]
    ValueSizeMismatch {
        /// Value record size configured on the table.
        expected: usize,

        /// Size of the type used for the access.
        actual: usize,
    },

    /// The operation is not supported by this type or in this combination.
    #[error("unsupported operation: {operation}")]
    Unsupported {
        /// Short description of what was attempted.
        operation: &'static str,
    },
}

/// Broad category of an [`Error`], for callers that only care about the class of failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Capacity exhausted, allocation refused or internal slot id out of range.
    Capacity,

    /// Index, offset or byte range outside the valid region.
    Bounds,

    /// Operation on a structure in the wrong state, or value size mismatch.
    State,

    /// Operation not supported.
    Unsupported,
}

impl Error {
    /// Returns the category this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. }
            | Self::AllocationFailed { .. }
            | Self::SlotOutOfRange { .. } => ErrorKind::Capacity,
            Self::OutOfBounds { .. } | Self::IndexOutOfRange { .. } => ErrorKind::Bounds,
            Self::NotCreated | Self::VacantSlot { .. } | Self::ValueSizeMismatch { .. } => {
                ErrorKind::State
            }
            Self::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }
}

/// A specialized `Result` type for raw collection operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
