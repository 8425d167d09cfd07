/// A snapshot of a heap's state, as returned by
/// [`Heap::stats`](crate::Heap::stats).
///
/// Block sizes include the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// The size of the largest free block. `0` if there is none.
    pub largest_free_block: usize,
    /// The size of the smallest free block. `0` if there is none.
    pub smallest_free_block: usize,
    /// The number of blocks in the free list.
    pub free_block_count: usize,
    /// The total size of all free blocks.
    pub available_bytes: usize,
    /// The lowest value `available_bytes` has had since construction.
    pub lifetime_min_available_bytes: usize,
    /// The number of allocations that returned a block.
    pub successful_allocation_count: usize,
    /// The number of blocks returned to the heap.
    pub successful_free_count: usize,
}

/// The part of [`HeapStats`] obtained by walking the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeListSummary {
    pub largest: usize,
    pub smallest: usize,
    pub count: usize,
}

/// The part of [`HeapStats`] taken from the heap's running counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Counters {
    pub free_bytes_remaining: usize,
    pub minimum_ever_free_bytes_remaining: usize,
    pub successful_allocations: usize,
    pub successful_frees: usize,
}

impl HeapStats {
    pub(crate) fn from_parts(summary: FreeListSummary, counters: Counters) -> Self {
        Self {
            largest_free_block: summary.largest,
            smallest_free_block: summary.smallest,
            free_block_count: summary.count,
            available_bytes: counters.free_bytes_remaining,
            lifetime_min_available_bytes: counters.minimum_ever_free_bytes_remaining,
            successful_allocation_count: counters.successful_allocations,
            successful_free_count: counters.successful_frees,
        }
    }
}
