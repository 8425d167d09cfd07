//! Compile-time and construction-time configuration
use const_default1::ConstDefault;

use crate::{error::HeapFault, utils::align_offset};

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "16")] {
        /// The alignment of every block and every returned payload.
        pub const ALIGNMENT: usize = 4;
    } else {
        /// The alignment of every block and every returned payload.
        pub const ALIGNMENT: usize = 8;
    }
}

/// The heap size used by the reference firmware configuration (20 KiB).
pub const DEFAULT_TOTAL_HEAP_SIZE: usize = 20 * 1024;

/// Construction-time options of a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Fill the payload of every freed block with zeros. Block headers are
    /// not affected.
    pub clear_memory_on_free: bool,
    /// Called with the requested size whenever `malloc` returns `None`.
    ///
    /// This is a diagnostic hook. The failed request is not retried.
    pub on_exhausted: Option<fn(usize)>,
    /// Called when `free` detects a double free, a forged allocation, or a
    /// corrupted header. It must not return.
    pub on_fault: fn(HeapFault) -> !,
}

impl HeapConfig {
    /// The default configuration: freed memory is left as is, no
    /// out-of-memory hook, and faults panic.
    pub const INIT: Self = Self {
        clear_memory_on_free: false,
        on_exhausted: None,
        on_fault: panic_on_fault,
    };

    /// Set [`Self::clear_memory_on_free`].
    #[inline]
    pub const fn with_clear_memory_on_free(self, clear_memory_on_free: bool) -> Self {
        Self {
            clear_memory_on_free,
            ..self
        }
    }

    /// Set [`Self::on_exhausted`].
    #[inline]
    pub const fn with_on_exhausted(self, on_exhausted: fn(usize)) -> Self {
        Self {
            on_exhausted: Some(on_exhausted),
            ..self
        }
    }

    /// Set [`Self::on_fault`].
    #[inline]
    pub const fn with_on_fault(self, on_fault: fn(HeapFault) -> !) -> Self {
        Self { on_fault, ..self }
    }
}

impl ConstDefault for HeapConfig {
    const DEFAULT: Self = Self::INIT;
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::INIT
    }
}

/// The default fault policy.
#[cold]
pub fn panic_on_fault(fault: HeapFault) -> ! {
    panic!("heap fault: {}", fault)
}

/// A fault policy that terminates the process immediately.
#[cfg(unix)]
#[cold]
pub fn abort_on_fault(fault: HeapFault) -> ! {
    log::error!("heap fault: {}", fault);
    unsafe { libc::abort() }
}

/// An [`ALIGNMENT`]-aligned backing buffer of `N` bytes, meant to be placed in
/// a `static`.
///
/// The start is already aligned, so no bytes are skipped at construction.
#[repr(C, align(8))]
pub struct HeapMemory<const N: usize = DEFAULT_TOTAL_HEAP_SIZE> {
    bytes: [u8; N],
}

impl<const N: usize> HeapMemory<N> {
    /// A zero-filled buffer.
    pub const fn new() -> Self {
        Self { bytes: [0; N] }
    }

    /// Get the buffer as a byte slice for [`Heap::new`](crate::Heap::new).
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert_eq!(align_offset(self.bytes.as_ptr() as usize, ALIGNMENT), 0);
        &mut self.bytes
    }
}

impl<const N: usize> ConstDefault for HeapMemory<N> {
    const DEFAULT: Self = Self::new();
}

impl<const N: usize> Default for HeapMemory<N> {
    fn default() -> Self {
        Self::new()
    }
}
