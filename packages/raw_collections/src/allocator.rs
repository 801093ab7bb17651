use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

/// A capability that hands out and takes back aligned memory blocks.
///
/// Every growable structure in this crate carries the allocator it was created with and
/// returns each block to the same allocator that produced it. The structures never choose
/// an allocator on their own.
///
/// # Safety
///
/// Implementations must return blocks that are valid for reads and writes of `layout.size()`
/// bytes, aligned to `layout.align()`, and that stay valid until passed to [`free`][Self::free].
pub unsafe trait BlockAllocator {
    /// Allocates a block with the given layout, returning `None` if the request cannot
    /// be satisfied.
    ///
    /// The layout is never zero-sized.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// The block must have been returned by [`allocate`][Self::allocate] on this allocator
    /// with the same `layout`, and must not have been freed already.
    unsafe fn free(&self, block: NonNull<u8>, layout: Layout);
}

/// The process-wide Rust allocator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Global;

// SAFETY: We forward to the global allocator, which upholds the block validity requirements.
unsafe impl BlockAllocator for Global {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "zero-sized blocks are never requested");

        // SAFETY: The layout is not zero-sized, as guaranteed by the callers in this crate.
        NonNull::new(unsafe { alloc(layout) })
    }

    #[inline]
    unsafe fn free(&self, block: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            dealloc(block.as_ptr(), layout);
        }
    }
}

// SAFETY: Forwarding to the referenced allocator, which upholds the requirements.
unsafe impl<A: BlockAllocator + ?Sized> BlockAllocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn free(&self, block: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            (**self).free(block, layout);
        }
    }
}
