//! Allocators for exercising allocation behavior in unit tests.

use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;

use crate::{BlockAllocator, Global};

/// Forwards to [`Global`] and counts allocations and frees.
#[derive(Debug, Default)]
pub(crate) struct CountingAllocator {
    allocations: Cell<usize>,
    frees: Cell<usize>,
}

impl CountingAllocator {
    pub(crate) fn allocations(&self) -> usize {
        self.allocations.get()
    }

    pub(crate) fn live_blocks(&self) -> usize {
        self.allocations.get() - self.frees.get()
    }
}

// SAFETY: Forwarding to the global allocator.
unsafe impl BlockAllocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.allocations.set(self.allocations.get() + 1);
        Global.allocate(layout)
    }

    unsafe fn free(&self, block: NonNull<u8>, layout: Layout) {
        self.frees.set(self.frees.get() + 1);

        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            Global.free(block, layout);
        }
    }
}

/// Refuses every allocation request.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RefusingAllocator;

// SAFETY: Never hands out a block.
unsafe impl BlockAllocator for RefusingAllocator {
    fn allocate(&self, _layout: Layout) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free(&self, _block: NonNull<u8>, _layout: Layout) {
        unreachable!("no block was ever allocated");
    }
}
