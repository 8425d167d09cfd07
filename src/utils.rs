/// Round `x` up to a multiple of `align`. Returns `None` on overflow.
///
/// `align` must be a power of two.
#[inline]
pub const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

/// Round `x` down to a multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_down(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// The number of bytes to skip from `addr` to reach the next `align`-byte
/// boundary.
#[inline]
pub const fn align_offset(addr: usize, align: usize) -> usize {
    addr.wrapping_neg() & (align - 1)
}

/// Read a native-endian `usize` at `bytes[at..]`.
///
/// # Panics
///
/// Panics if `bytes` doesn't contain a whole word at `at`.
#[inline]
pub fn read_word(bytes: &[u8], at: usize) -> usize {
    let mut word = [0u8; core::mem::size_of::<usize>()];
    word.copy_from_slice(&bytes[at..at + core::mem::size_of::<usize>()]);
    usize::from_ne_bytes(word)
}

/// Write a native-endian `usize` at `bytes[at..]`.
///
/// # Panics
///
/// Panics if `bytes` doesn't contain a whole word at `at`.
#[inline]
pub fn write_word(bytes: &mut [u8], at: usize, value: usize) {
    let word = value.to_ne_bytes();
    bytes[at..at + word.len()].copy_from_slice(&word);
}
