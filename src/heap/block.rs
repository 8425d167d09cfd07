//! Block header layout and the encoding of the allocation flag.
//!
//! Every block, free or allocated, starts with a header of [`HEADER_SIZE`]
//! bytes holding two native-endian words:
//!
//! | offset         | field       |
//! |----------------|-------------|
//! | [`NEXT_FREE`]  | `next_free` |
//! | [`SIZE`]       | `size`      |
use core::mem;

use crate::{config::ALIGNMENT, utils::checked_align_up};

/// The offset of the `next_free` word within a header.
pub(super) const NEXT_FREE: usize = 0;
/// The offset of the `size` word within a header.
pub(super) const SIZE: usize = mem::size_of::<usize>();

/// The size of a block header, rounded up to [`ALIGNMENT`]. Every block
/// starts with one, and every payload starts right after it.
pub const HEADER_SIZE: usize = match checked_align_up(2 * mem::size_of::<usize>(), ALIGNMENT) {
    Some(x) => x,
    None => panic!("header size overflows"),
};

/// A free block is split only if the remainder would be larger than this.
pub const MINIMUM_BLOCK_SIZE: usize = HEADER_SIZE << 1;

/// The `next_free` value of an allocated block and of the tail sentinel.
pub(super) const NO_BLOCK: usize = usize::MAX;

/// The bit of the `size` word telling that the block belongs to the
/// application.
const ALLOCATED_BIT: usize = 1 << (usize::BITS - 1);

/// The contents of a header's `size` word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) struct BlockSize(usize);

impl BlockSize {
    /// A free block of `bytes` bytes.
    #[inline]
    pub fn free(bytes: usize) -> Self {
        debug_assert!(Self::is_representable(bytes));
        Self(bytes)
    }

    #[inline]
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    /// The size of the whole block, including the header.
    #[inline]
    pub fn bytes(self) -> usize {
        self.0 & !ALLOCATED_BIT
    }

    #[inline]
    pub fn is_allocated(self) -> bool {
        (self.0 & ALLOCATED_BIT) != 0
    }

    #[inline]
    pub fn allocated(self) -> Self {
        Self(self.0 | ALLOCATED_BIT)
    }

    #[inline]
    pub fn freed(self) -> Self {
        Self(self.0 & !ALLOCATED_BIT)
    }

    /// Check that `bytes` can be stored without touching the allocation flag.
    #[inline]
    pub fn is_representable(bytes: usize) -> bool {
        (bytes & ALLOCATED_BIT) == 0
    }
}

impl core::fmt::Debug for BlockSize {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockSize")
            .field("bytes", &self.bytes())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_round_trip() {
        let size = BlockSize::free(96);
        assert!(!size.is_allocated());
        let used = size.allocated();
        assert!(used.is_allocated());
        assert_eq!(used.bytes(), 96);
        assert_ne!(used.raw(), size.raw());
        assert_eq!(used.freed(), size);
    }

    #[test]
    fn top_bit_is_not_representable() {
        assert!(BlockSize::is_representable(usize::MAX >> 1));
        assert!(!BlockSize::is_representable(!(usize::MAX >> 1)));
        assert!(!BlockSize::is_representable(usize::MAX));
    }

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
        assert!(HEADER_SIZE >= SIZE + mem::size_of::<usize>());
        assert_eq!(MINIMUM_BLOCK_SIZE, HEADER_SIZE * 2);
    }
}
