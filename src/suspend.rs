//! Mutual exclusion providers for [`LockedHeap`](crate::LockedHeap)
use core::cell::Cell;

use const_default1::ConstDefault;

/// Suspends every other mutator of a shared heap, like an RTOS's "suspend
/// all tasks" primitive.
///
/// # Safety
///
/// Between a call to [`Self::suspend_all`] and the matching
/// [`Self::resume_all`], no other thread of control may return from
/// `suspend_all` on the same provider, and [`Self::critical`] must not run
/// concurrently with such a section. This crate never nests these calls.
pub unsafe trait SuspendAll {
    /// Enter the exclusive section.
    fn suspend_all(&self);

    /// Leave the exclusive section.
    ///
    /// # Safety
    ///
    /// The caller must be inside a section entered by [`Self::suspend_all`]
    /// on the same thread of control.
    unsafe fn resume_all(&self);

    /// Run `f` inside a short exclusive section. This is used for reading
    /// the heap's counters and may be cheaper than `suspend_all`.
    #[inline]
    fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        let _suspended = Suspended::new(self);
        f()
    }
}

/// Keeps a [`SuspendAll`] section open until dropped.
pub(crate) struct Suspended<'a, S: SuspendAll + ?Sized>(&'a S);

impl<'a, S: SuspendAll + ?Sized> Suspended<'a, S> {
    #[inline]
    pub fn new(suspend: &'a S) -> Self {
        suspend.suspend_all();
        Self(suspend)
    }
}

impl<S: SuspendAll + ?Sized> Drop for Suspended<'_, S> {
    #[inline]
    fn drop(&mut self) {
        // Safety: Entered by `Suspended::new`
        unsafe { self.0.resume_all() };
    }
}

/// [`SuspendAll`] implemented by the [`critical_section`] crate, which masks
/// interrupts on single-core microcontrollers.
///
/// The application (or its HAL) must provide a `critical_section`
/// implementation. Sections may nest; only the outermost `resume_all` leaves
/// the critical section.
pub struct CriticalSection {
    /// The nesting depth. Only touched inside the section.
    depth: Cell<usize>,
    /// The state returned by the outermost `acquire`. Only touched inside the
    /// section.
    restore: Cell<Option<critical_section::RestoreState>>,
}

// Safety: `depth` and `restore` are only accessed while the critical section
//         is held
unsafe impl Sync for CriticalSection {}

impl CriticalSection {
    pub const fn new() -> Self {
        Self {
            depth: Cell::new(0),
            restore: Cell::new(None),
        }
    }
}

impl ConstDefault for CriticalSection {
    const DEFAULT: Self = Self::new();
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl SuspendAll for CriticalSection {
    #[inline]
    fn suspend_all(&self) {
        // Safety: Released below (nested) or by the matching `resume_all`
        let state = unsafe { critical_section::acquire() };
        let depth = self.depth.get();
        if depth == 0 {
            self.restore.set(Some(state));
        } else {
            // Already inside the section. Releasing the nested state keeps
            // the outer one in effect.
            // Safety: `state` is the most recent `acquire`
            unsafe { critical_section::release(state) };
        }
        self.depth.set(depth + 1);
    }

    #[inline]
    unsafe fn resume_all(&self) {
        let depth = self.depth.get();
        debug_assert_ne!(depth, 0, "`resume_all` without `suspend_all`");
        self.depth.set(depth.saturating_sub(1));
        if depth == 1 {
            if let Some(state) = self.restore.take() {
                critical_section::release(state);
            }
        }
    }

    #[inline]
    fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        critical_section::with(|_| f())
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
#[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
pub use self::unix::PthreadSuspendAll;

#[cfg(test)]
mod tests;
