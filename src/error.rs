use core::fmt;

/// Misuse or corruption detected while handling a block.
///
/// These are programming errors. [`Heap::free`](crate::Heap::free) escalates
/// them to [`HeapConfig::on_fault`](crate::HeapConfig::on_fault).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapFault {
    /// The allocation does not point inside the heap's block area.
    OutOfBounds { offset: usize },
    /// The allocation's header is not on an alignment boundary.
    Misaligned { offset: usize },
    /// The block is not currently allocated, most likely a double free.
    NotAllocated { offset: usize },
    /// The block is marked allocated, but its free-list link was overwritten.
    CorruptLink { offset: usize, link: usize },
    /// The block's recorded size doesn't fit in the heap.
    CorruptSize { offset: usize, size: usize },
    /// A free-list entry is out of address order.
    Unordered { offset: usize },
    /// Two free blocks are adjacent but were not merged.
    Uncoalesced { offset: usize },
    /// The free list disagrees with the free byte counter.
    AccountingMismatch { counted: usize, recorded: usize },
    /// A [`LockedHeap`](crate::LockedHeap) was used before `init`.
    Uninitialized,
    /// A [`LockedHeap`](crate::LockedHeap) was used by the task that holds
    /// its [`HeapGuard`](crate::HeapGuard).
    Reentered,
}

impl fmt::Display for HeapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OutOfBounds { offset } => {
                write!(f, "offset {:#x} is outside of the heap", offset)
            }
            Self::Misaligned { offset } => {
                write!(f, "offset {:#x} is not a block boundary", offset)
            }
            Self::NotAllocated { offset } => write!(
                f,
                "double free or freeing an unallocated block at {:#x}",
                offset
            ),
            Self::CorruptLink { offset, link } => write!(
                f,
                "allocated block at {:#x} has a free-list link {:#x}",
                offset, link
            ),
            Self::CorruptSize { offset, size } => {
                write!(f, "block at {:#x} has an invalid size {:#x}", offset, size)
            }
            Self::Unordered { offset } => {
                write!(f, "free block at {:#x} is out of address order", offset)
            }
            Self::Uncoalesced { offset } => write!(
                f,
                "free block at {:#x} is adjacent to the next free block",
                offset
            ),
            Self::AccountingMismatch { counted, recorded } => write!(
                f,
                "free list holds {} bytes but {} are recorded",
                counted, recorded
            ),
            Self::Uninitialized => f.write_str("the heap is not initialized"),
            Self::Reentered => f.write_str("the heap is already locked by this task"),
        }
    }
}

/// Failure to set up a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The buffer can't hold the tail sentinel plus a minimum-sized block.
    TooSmall { len: usize, min_len: usize },
    /// [`LockedHeap::init`](crate::LockedHeap::init) was called twice.
    AlreadyInitialized,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TooSmall { len, min_len } => write!(
                f,
                "a {}-byte buffer is too small for a heap (at least {} aligned bytes are needed)",
                len, min_len
            ),
            Self::AlreadyInitialized => f.write_str("the heap is already initialized"),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for HeapFault {}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for InitError {}
