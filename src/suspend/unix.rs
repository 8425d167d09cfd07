use const_default1::ConstDefault;
use core::ptr::addr_of_mut;

use super::SuspendAll;

/// [`SuspendAll`] backed by a process-wide `pthread_mutex_t`, for running
/// shared heaps on a hosted target.
///
/// Every instance shares the same mutex, so sections on different heaps
/// exclude each other, too.
pub struct PthreadSuspendAll(());

/// `pthread_mutex_t` might be unsafe to move, so we can't put it in
/// `PthreadSuspendAll`.
static mut MUTEX: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

impl PthreadSuspendAll {
    pub const fn new() -> Self {
        Self(())
    }
}

impl ConstDefault for PthreadSuspendAll {
    const DEFAULT: Self = Self::new();
}

impl Default for PthreadSuspendAll {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl SuspendAll for PthreadSuspendAll {
    #[inline]
    fn suspend_all(&self) {
        let result = unsafe { libc::pthread_mutex_lock(addr_of_mut!(MUTEX)) };
        if result != 0 {
            // The mutex is unusable; continuing would race on the heap
            unsafe { libc::abort() };
        }
    }

    #[inline]
    unsafe fn resume_all(&self) {
        libc::pthread_mutex_unlock(addr_of_mut!(MUTEX));
    }
}
