//! The first-fit heap core
use core::{cmp, fmt, num::NonZeroUsize};

use crate::{
    config::{HeapConfig, ALIGNMENT},
    error::{HeapFault, InitError},
    stats::{Counters, FreeListSummary, HeapStats},
    utils::{align_down, align_offset, checked_align_up, read_word, write_word},
};

mod block;
use self::block::{BlockSize, NEXT_FREE, NO_BLOCK, SIZE};
pub use self::block::{HEADER_SIZE, MINIMUM_BLOCK_SIZE};

#[cfg_attr(doc, svgbobdoc::transform)]
/// A first-fit heap over a caller-provided buffer.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///    head
///   ,-----,
///   |  O  |
///   '--+--'
///      |
///      v
///   ,------+------+---------,------+------+-----------,------+------+-------,------+------,
///   | next | size | free    | next | size | allocated | next | size | free  | next | size |
///   |  O   |  48  |         |  -   |  64* |           |  O   |  96  |       |  -   |  0   |
///   '--+---+------+---------'------+------+-----------'--+---+------+-------'------+------'
///      |                                                ^  |                    ^  tail
///      '------------------------------------------------'  '--------------------'
/// ```
/// </center>
///
/// Free blocks form a singly-linked list sorted by address, starting at
/// `head` (which lives outside the pool) and ending at the `tail` sentinel
/// (a zero-sized header at the end of the pool). The most significant bit of
/// `size` (`*` above) marks an allocated block, whose `next` holds a
/// sentinel value instead of a link.
///
/// # Properties
///
/// Every block is aligned to [`ALIGNMENT`] bytes and starts with a
/// [`HEADER_SIZE`]-byte header. A block is split on allocation only if the
/// remainder exceeds [`MINIMUM_BLOCK_SIZE`]. No two free blocks are ever
/// adjacent.
pub struct Heap<'pool> {
    /// The aligned part of the buffer. Block offsets are relative to its
    /// start.
    pool: &'pool mut [u8],
    /// `head.next_free`
    head: usize,
    /// The offset of the tail sentinel.
    tail: usize,
    free_bytes_remaining: usize,
    minimum_ever_free_bytes_remaining: usize,
    successful_allocations: usize,
    successful_frees: usize,
    config: HeapConfig,
}

/// A live allocation: the offset of its payload from [`Heap::begin`].
///
/// The payload is aligned to [`ALIGNMENT`] bytes in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Allocation(NonZeroUsize);

impl Allocation {
    /// Reconstruct an allocation from an offset returned by
    /// [`Self::offset`]. Returns `None` if `offset` is zero.
    ///
    /// The offset is validated when the allocation is used.
    #[inline]
    pub fn from_offset(offset: usize) -> Option<Self> {
        NonZeroUsize::new(offset).map(Self)
    }

    /// The offset of the payload from [`Heap::begin`].
    #[inline]
    pub fn offset(self) -> usize {
        self.0.get()
    }

    #[inline]
    fn for_block(block: usize) -> Self {
        // Safety: A payload follows a non-empty header
        Self(unsafe { NonZeroUsize::new_unchecked(block + HEADER_SIZE) })
    }
}

/// A block in the free list, as reported by [`Heap::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// The offset of the block header from [`Heap::begin`].
    pub offset: usize,
    /// The size of the whole block, including the header.
    pub size: usize,
}

/// An iterator over the free list in address order.
pub struct FreeBlocks<'a, 'pool> {
    heap: &'a Heap<'pool>,
    next: usize,
}

impl Iterator for FreeBlocks<'_, '_> {
    type Item = FreeBlock;

    #[inline]
    fn next(&mut self) -> Option<FreeBlock> {
        if self.next >= self.heap.tail {
            return None;
        }
        let block = self.next;
        self.next = self.heap.next_free(Node::Block(block));
        Some(FreeBlock {
            offset: block,
            size: self.heap.block_size(block).bytes(),
        })
    }
}

/// A position in the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Head,
    Block(usize),
}

impl fmt::Debug for Heap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("pool", &self.pool.as_ptr_range())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("free_bytes_remaining", &self.free_bytes_remaining)
            .field(
                "minimum_ever_free_bytes_remaining",
                &self.minimum_ever_free_bytes_remaining,
            )
            .field("successful_allocations", &self.successful_allocations)
            .field("successful_frees", &self.successful_frees)
            .finish()
    }
}

impl<'pool> Heap<'pool> {
    /// Create a heap over `buffer` with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is too small. See [`Self::try_new`].
    pub fn new(buffer: &'pool mut [u8]) -> Self {
        Self::with_config(buffer, HeapConfig::INIT)
    }

    /// Create a heap over `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is too small. See [`Self::try_new`].
    pub fn with_config(buffer: &'pool mut [u8], config: HeapConfig) -> Self {
        match Self::try_new(buffer, config) {
            Ok(heap) => heap,
            Err(e) => panic!("{}", e),
        }
    }

    /// Create a heap over `buffer`.
    ///
    /// The start of `buffer` is rounded up to [`ALIGNMENT`] bytes. A tail
    /// sentinel is placed at the end, and the rest becomes a single free
    /// block, which must be at least [`MINIMUM_BLOCK_SIZE`] bytes long.
    pub fn try_new(buffer: &'pool mut [u8], config: HeapConfig) -> Result<Self, InitError> {
        let len = buffer.len();
        let too_small = InitError::TooSmall {
            len,
            min_len: MINIMUM_BLOCK_SIZE + HEADER_SIZE,
        };

        // Ensure the heap starts on a correctly aligned boundary
        let skip = align_offset(buffer.as_ptr() as usize, ALIGNMENT);
        let pool = buffer.get_mut(skip..).ok_or(too_small)?;

        // The tail sentinel takes the last aligned header slot
        let tail = align_down(
            pool.len().checked_sub(HEADER_SIZE).ok_or(too_small)?,
            ALIGNMENT,
        );
        if tail < MINIMUM_BLOCK_SIZE || !BlockSize::is_representable(tail) {
            return Err(too_small);
        }

        let mut heap = Self {
            pool,
            head: 0,
            tail,
            free_bytes_remaining: tail,
            minimum_ever_free_bytes_remaining: tail,
            successful_allocations: 0,
            successful_frees: 0,
            config,
        };

        heap.set_block_size(tail, BlockSize::free(0));
        heap.set_next_free(Node::Block(tail), NO_BLOCK);

        // Only one block exists, and it covers the entire usable pool
        heap.set_block_size(0, BlockSize::free(tail));
        heap.set_next_free(Node::Block(0), tail);

        log::debug!(
            "heap: {} bytes at {:p} ({} skipped for alignment), capacity {}",
            len,
            heap.pool.as_ptr(),
            skip,
            tail
        );

        Ok(heap)
    }

    /// The configuration this heap was created with.
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The start of the aligned pool. [`Allocation`] and [`FreeBlock`]
    /// offsets are relative to this address.
    #[inline]
    pub fn begin(&self) -> *const u8 {
        self.pool.as_ptr()
    }

    /// One past the last byte of the pool.
    #[inline]
    pub fn end(&self) -> *const u8 {
        self.pool.as_ptr_range().end
    }

    /// The size of the initial free block, i.e., the value of
    /// [`Self::free_bytes_remaining`] when nothing is allocated.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.tail
    }

    /// The total size of all free blocks, including their headers. The free
    /// space is not necessarily contiguous.
    #[inline]
    pub fn free_bytes_remaining(&self) -> usize {
        self.free_bytes_remaining
    }

    /// The lowest value [`Self::free_bytes_remaining`] has had.
    #[inline]
    pub fn minimum_ever_free_bytes_remaining(&self) -> usize {
        self.minimum_ever_free_bytes_remaining
    }

    #[inline]
    fn block_size(&self, block: usize) -> BlockSize {
        BlockSize::from_raw(read_word(self.pool, block + SIZE))
    }

    #[inline]
    fn set_block_size(&mut self, block: usize, size: BlockSize) {
        write_word(self.pool, block + SIZE, size.raw());
    }

    #[inline]
    fn next_free(&self, node: Node) -> usize {
        match node {
            Node::Head => self.head,
            Node::Block(block) => read_word(self.pool, block + NEXT_FREE),
        }
    }

    #[inline]
    fn set_next_free(&mut self, node: Node, next: usize) {
        match node {
            Node::Head => self.head = next,
            Node::Block(block) => write_word(self.pool, block + NEXT_FREE, next),
        }
    }

    /// Insert a free block into the free list, merging it with the blocks
    /// immediately before and after it if they are contiguous.
    ///
    /// The block's `size` must be set and its allocation flag clear. Its
    /// `next_free` is overwritten.
    fn insert_block_into_free_list(&mut self, mut block: usize) {
        debug_assert!(!self.block_size(block).is_allocated());

        // Find the last node below `block`
        let mut it = Node::Head;
        while self.next_free(it) < block {
            it = Node::Block(self.next_free(it));
        }

        // Does the preceding block end where `block` starts?
        if let Node::Block(prev) = it {
            let prev_size = self.block_size(prev).bytes();
            if prev + prev_size == block {
                let size = prev_size + self.block_size(block).bytes();
                log::trace!("heap: merging {:#x} into {:#x}", block, prev);
                self.set_block_size(prev, BlockSize::free(size));
                block = prev;
            }
        }

        // Does `block` end where the following block starts? The tail is
        // never absorbed.
        let next = self.next_free(it);
        let size = self.block_size(block).bytes();
        if block + size == next && next != self.tail {
            log::trace!("heap: merging {:#x} into {:#x}", next, block);
            let size = size + self.block_size(next).bytes();
            let next_next = self.next_free(Node::Block(next));
            self.set_block_size(block, BlockSize::free(size));
            self.set_next_free(Node::Block(block), next_next);
        } else {
            self.set_next_free(Node::Block(block), next);
        }

        // If `block` was merged into the preceding block, the link is already
        // in place, and setting it here would make the block point to itself.
        if it != Node::Block(block) {
            self.set_next_free(it, block);
        }
    }

    /// The size of the block needed to hold `wanted_size` bytes of payload.
    /// Returns `None` if the request can't be satisfied by any heap.
    #[inline]
    fn required_block_size(wanted_size: usize) -> Option<usize> {
        if wanted_size == 0 {
            return None;
        }
        let size = checked_align_up(wanted_size.checked_add(HEADER_SIZE)?, ALIGNMENT)?;
        // The top bit of `size` is reserved for the allocation flag
        BlockSize::is_representable(size).then(|| size)
    }

    /// [`Self::malloc`] without the out-of-memory hook.
    pub(crate) fn allocate(&mut self, wanted_size: usize) -> Option<Allocation> {
        let required = Self::required_block_size(wanted_size)?;
        if required > self.free_bytes_remaining {
            return None;
        }

        // Traverse the list from the lowest address until a large enough
        // block is found. The tail (size 0, no next block) stops the search.
        let mut prev = Node::Head;
        let mut block = self.head;
        while self.block_size(block).bytes() < required
            && self.next_free(Node::Block(block)) != NO_BLOCK
        {
            prev = Node::Block(block);
            block = self.next_free(prev);
        }

        if block == self.tail {
            return None;
        }

        // Take the block out of the free list
        let next = self.next_free(Node::Block(block));
        self.set_next_free(prev, next);

        // Split the block if the remainder can serve as a block on its own
        let size = self.block_size(block).bytes();
        debug_assert!(size >= required);
        let size = if size - required > MINIMUM_BLOCK_SIZE {
            let remainder = block + required;
            debug_assert_eq!(remainder % ALIGNMENT, 0);
            log::trace!(
                "heap: splitting {:#x} ({} bytes) at {:#x}",
                block,
                size,
                remainder
            );
            self.set_block_size(remainder, BlockSize::free(size - required));
            self.set_block_size(block, BlockSize::free(required));
            self.insert_block_into_free_list(remainder);
            required
        } else {
            size
        };

        self.free_bytes_remaining -= size;
        self.minimum_ever_free_bytes_remaining = cmp::min(
            self.minimum_ever_free_bytes_remaining,
            self.free_bytes_remaining,
        );

        // The block now belongs to the application and has no next block
        self.set_block_size(block, BlockSize::free(size).allocated());
        self.set_next_free(Node::Block(block), NO_BLOCK);
        self.successful_allocations += 1;

        let ptr = Allocation::for_block(block);
        log::trace!("heap: malloc({}) -> {:?}", wanted_size, ptr);
        Some(ptr)
    }

    /// Allocate a block with room for at least `wanted_size` bytes.
    ///
    /// Returns `None` if `wanted_size` is zero, if the size computation
    /// overflows, or if no free block is large enough. In any of these cases
    /// [`HeapConfig::on_exhausted`] is called.
    pub fn malloc(&mut self, wanted_size: usize) -> Option<Allocation> {
        let ptr = self.allocate(wanted_size);
        if ptr.is_none() {
            self.exhausted(wanted_size);
        }
        ptr
    }

    /// The number of bytes `calloc(count, element_size)` requests. Returns
    /// `None` on overflow.
    #[inline]
    pub(crate) fn calloc_size(count: usize, element_size: usize) -> Option<usize> {
        count.checked_mul(element_size)
    }

    /// [`Self::allocate`] followed by zero-filling the first `size` bytes.
    pub(crate) fn allocate_zeroed(&mut self, size: usize) -> Option<Allocation> {
        let ptr = self.allocate(size)?;
        self.pool[ptr.offset()..ptr.offset() + size].fill(0);
        Some(ptr)
    }

    /// Allocate a zero-filled array of `count` elements of `element_size`
    /// bytes each.
    ///
    /// Returns `None` without touching the heap if `count * element_size`
    /// overflows. Otherwise behaves like [`Self::malloc`].
    pub fn calloc(&mut self, count: usize, element_size: usize) -> Option<Allocation> {
        let size = Self::calloc_size(count, element_size)?;
        let ptr = self.allocate_zeroed(size);
        if ptr.is_none() {
            self.exhausted(size);
        }
        ptr
    }

    /// Report a failed allocation of `wanted_size` bytes.
    #[inline]
    fn exhausted(&self, wanted_size: usize) {
        report_exhausted(&self.config, wanted_size, self.free_bytes_remaining);
    }

    /// Locate the header of an allocation, checking that the block is
    /// currently allocated.
    fn allocated_block(&self, ptr: Allocation) -> Result<usize, HeapFault> {
        let offset = ptr.offset();
        let block = offset
            .checked_sub(HEADER_SIZE)
            .filter(|&block| block < self.tail)
            .ok_or(HeapFault::OutOfBounds { offset })?;
        if block % ALIGNMENT != 0 {
            return Err(HeapFault::Misaligned { offset });
        }

        let size = self.block_size(block);
        if !size.is_allocated() {
            return Err(HeapFault::NotAllocated { offset });
        }

        let link = self.next_free(Node::Block(block));
        if link != NO_BLOCK {
            return Err(HeapFault::CorruptLink { offset, link });
        }

        let bytes = size.bytes();
        if bytes < HEADER_SIZE
            || bytes % ALIGNMENT != 0
            || block.checked_add(bytes).map_or(true, |end| end > self.tail)
        {
            return Err(HeapFault::CorruptSize {
                offset,
                size: bytes,
            });
        }

        Ok(block)
    }

    /// Escalate a fault to the configured handler.
    #[cold]
    fn fault(&self, fault: HeapFault) -> ! {
        log::error!("heap: {}", fault);
        (self.config.on_fault)(fault)
    }

    /// Return an allocation to the heap, or report why it can't be.
    ///
    /// On error, the heap is left untouched.
    pub fn try_free(&mut self, ptr: Allocation) -> Result<(), HeapFault> {
        let block = self.allocated_block(ptr)?;

        // The block is being returned to the heap and is no longer allocated
        let size = self.block_size(block).freed();
        self.set_block_size(block, size);

        if self.config.clear_memory_on_free {
            self.pool[block + HEADER_SIZE..block + size.bytes()].fill(0);
        }

        self.free_bytes_remaining += size.bytes();
        self.insert_block_into_free_list(block);
        self.successful_frees += 1;

        log::trace!("heap: free({:?}) ({} bytes)", ptr, size.bytes());
        Ok(())
    }

    /// Return an allocation to the heap. Does nothing if `ptr` is `None`.
    ///
    /// Freeing a block that is not currently allocated invokes
    /// [`HeapConfig::on_fault`], which does not return.
    pub fn free(&mut self, ptr: Option<Allocation>) {
        if let Some(ptr) = ptr {
            if let Err(fault) = self.try_free(ptr) {
                self.fault(fault);
            }
        }
    }

    /// The number of payload bytes available in an allocation. This can be
    /// larger than the requested size.
    ///
    /// Invokes [`HeapConfig::on_fault`] if `ptr` is not allocated.
    pub fn usable_size(&self, ptr: Allocation) -> usize {
        self.try_usable_size(ptr)
            .unwrap_or_else(|fault| self.fault(fault))
    }

    /// [`Self::usable_size`] that reports a misused `ptr` to the caller.
    pub fn try_usable_size(&self, ptr: Allocation) -> Result<usize, HeapFault> {
        let block = self.allocated_block(ptr)?;
        Ok(self.block_size(block).bytes() - HEADER_SIZE)
    }

    /// Get the payload of an allocation.
    ///
    /// Invokes [`HeapConfig::on_fault`] if `ptr` is not allocated.
    pub fn payload(&self, ptr: Allocation) -> &[u8] {
        match self.try_payload(ptr) {
            Ok(payload) => payload,
            Err(fault) => self.fault(fault),
        }
    }

    /// [`Self::payload`] that reports a misused `ptr` to the caller.
    pub fn try_payload(&self, ptr: Allocation) -> Result<&[u8], HeapFault> {
        let block = self.allocated_block(ptr)?;
        Ok(&self.pool[ptr.offset()..block + self.block_size(block).bytes()])
    }

    /// Get the payload of an allocation mutably.
    ///
    /// Invokes [`HeapConfig::on_fault`] if `ptr` is not allocated.
    pub fn payload_mut(&mut self, ptr: Allocation) -> &mut [u8] {
        match self.allocated_block(ptr) {
            Ok(block) => {
                let end = block + self.block_size(block).bytes();
                &mut self.pool[ptr.offset()..end]
            }
            Err(fault) => self.fault(fault),
        }
    }

    /// [`Self::payload_mut`] that reports a misused `ptr` to the caller.
    pub fn try_payload_mut(&mut self, ptr: Allocation) -> Result<&mut [u8], HeapFault> {
        let block = self.allocated_block(ptr)?;
        let end = block + self.block_size(block).bytes();
        Ok(&mut self.pool[ptr.offset()..end])
    }

    /// Iterate over the free list in address order.
    #[inline]
    pub fn free_blocks(&self) -> FreeBlocks<'_, 'pool> {
        FreeBlocks {
            heap: self,
            next: self.head,
        }
    }

    pub(crate) fn free_list_summary(&self) -> FreeListSummary {
        let mut summary = FreeListSummary {
            largest: 0,
            smallest: usize::MAX,
            count: 0,
        };
        for block in self.free_blocks() {
            summary.count += 1;
            summary.largest = cmp::max(summary.largest, block.size);
            summary.smallest = cmp::min(summary.smallest, block.size);
        }
        if summary.count == 0 {
            summary.smallest = 0;
        }
        summary
    }

    pub(crate) fn counters(&self) -> Counters {
        Counters {
            free_bytes_remaining: self.free_bytes_remaining,
            minimum_ever_free_bytes_remaining: self.minimum_ever_free_bytes_remaining,
            successful_allocations: self.successful_allocations,
            successful_frees: self.successful_frees,
        }
    }

    /// Walk the free list and take a snapshot of the heap's state.
    pub fn stats(&self) -> HeapStats {
        HeapStats::from_parts(self.free_list_summary(), self.counters())
    }

    /// Walk the free list and check its invariants: every entry is aligned,
    /// free, in bounds, and in strictly increasing address order, no two
    /// entries are adjacent, the list ends at the tail, and the sizes add up
    /// to [`Self::free_bytes_remaining`].
    pub fn check_integrity(&self) -> Result<(), HeapFault> {
        let mut counted = 0usize;
        let mut prev_end = None;
        let mut block = self.head;

        while block != self.tail {
            if block > self.tail {
                return Err(HeapFault::OutOfBounds { offset: block });
            }
            if block % ALIGNMENT != 0 {
                return Err(HeapFault::Misaligned { offset: block });
            }

            let size = self.block_size(block);
            if size.is_allocated() {
                return Err(HeapFault::CorruptLink {
                    offset: block,
                    link: self.next_free(Node::Block(block)),
                });
            }

            let bytes = size.bytes();
            let end = block
                .checked_add(bytes)
                .filter(|&end| bytes >= HEADER_SIZE && end <= self.tail)
                .ok_or(HeapFault::CorruptSize {
                    offset: block,
                    size: bytes,
                })?;

            match prev_end {
                Some(prev_end) if block < prev_end => {
                    return Err(HeapFault::Unordered { offset: block })
                }
                Some(prev_end) if block == prev_end => {
                    return Err(HeapFault::Uncoalesced { offset: block })
                }
                _ => {}
            }

            counted += bytes;
            prev_end = Some(end);
            block = self.next_free(Node::Block(block));
        }

        if counted != self.free_bytes_remaining {
            return Err(HeapFault::AccountingMismatch {
                counted,
                recorded: self.free_bytes_remaining,
            });
        }

        Ok(())
    }
}

/// Log a failed allocation of `wanted_size` bytes and call the
/// out-of-memory hook, if any.
pub(crate) fn report_exhausted(config: &HeapConfig, wanted_size: usize, free_bytes: usize) {
    log::warn!(
        "heap: malloc({}) failed with {} bytes free",
        wanted_size,
        free_bytes
    );
    if let Some(hook) = config.on_exhausted {
        hook(wanted_size);
    }
}
