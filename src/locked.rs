use core::{
    cell::{Cell, UnsafeCell},
    fmt, ops,
};

use const_default1::ConstDefault;

use crate::{
    config::panic_on_fault,
    error::{HeapFault, InitError},
    heap::{report_exhausted, Allocation, Heap},
    stats::HeapStats,
    suspend::{SuspendAll, Suspended},
};

/// A [`Heap`] shared between tasks.
///
/// Every operation that walks or modifies the free list runs inside a
/// [`SuspendAll`] section. The counters are read in a shorter
/// [`SuspendAll::critical`] section.
///
/// A `LockedHeap` starts out uninitialized so that it can be placed in a
/// `static`. Until [`Self::init`] is called, allocation fails and freeing
/// invokes [`panic_on_fault`] with [`HeapFault::Uninitialized`].
///
/// While a task holds the [`HeapGuard`] returned by [`Self::lock`], using the
/// same `LockedHeap` from that task is a programming error. `lock` reports it
/// as [`HeapFault::Reentered`], and the other methods escalate it to
/// [`panic_on_fault`]. With a non-reentrant provider such as
/// [`PthreadSuspendAll`](crate::PthreadSuspendAll), it deadlocks instead.
///
/// # Examples
///
/// ```rust
/// use ffheap::{Heap, HeapMemory, LockedHeap, PthreadSuspendAll};
///
/// static HEAP: LockedHeap<'static, PthreadSuspendAll> = LockedHeap::INIT;
///
/// let memory: &'static mut HeapMemory<2048> = Box::leak(Box::new(HeapMemory::new()));
/// HEAP.init(Heap::new(memory.as_mut_slice())).unwrap();
///
/// let threads: Vec<_> = (0..4)
///     .map(|i| {
///         std::thread::spawn(move || {
///             let a = HEAP.malloc(64).unwrap();
///             HEAP.lock().unwrap().payload_mut(a)[0] = i;
///             HEAP.free(Some(a));
///         })
///     })
///     .collect();
/// for thread in threads {
///     thread.join().unwrap();
/// }
///
/// assert_eq!(HEAP.stats().successful_free_count, 4);
/// ```
pub struct LockedHeap<'pool, S> {
    inner: UnsafeCell<Option<Heap<'pool>>>,
    /// Set while a [`HeapGuard`] exists. Only touched inside a `suspend`
    /// section.
    locked: Cell<bool>,
    suspend: S,
}

// Safety: `inner` and `locked` are only accessed inside a `suspend` section,
//         and `locked` prevents handing out `inner` twice
unsafe impl<S: SuspendAll + Sync> Sync for LockedHeap<'_, S> {}

impl<'pool, S: ConstDefault> LockedHeap<'pool, S> {
    /// An uninitialized heap. Call [`Self::init`] before use.
    pub const INIT: Self = Self::new(S::DEFAULT);
}

impl<'pool, S: ConstDefault> ConstDefault for LockedHeap<'pool, S> {
    const DEFAULT: Self = Self::INIT;
}

impl<'pool, S> LockedHeap<'pool, S> {
    /// Construct an uninitialized heap using the specified exclusion
    /// provider.
    pub const fn new(suspend: S) -> Self {
        Self {
            inner: UnsafeCell::new(None),
            locked: Cell::new(false),
            suspend,
        }
    }

    /// Construct an initialized heap.
    pub fn with_heap(heap: Heap<'pool>, suspend: S) -> Self {
        Self {
            inner: UnsafeCell::new(Some(heap)),
            locked: Cell::new(false),
            suspend,
        }
    }

    /// Take the heap back, leaving `self` uninitialized.
    #[inline]
    pub fn take(&mut self) -> Option<Heap<'pool>> {
        self.inner.get_mut().take()
    }
}

/// Log `fault` and hand it to `on_fault`.
#[cold]
fn escalate(fault: HeapFault, on_fault: fn(HeapFault) -> !) -> ! {
    log::error!("heap: {}", fault);
    on_fault(fault)
}

impl<'pool, S: SuspendAll> LockedHeap<'pool, S> {
    /// Install `heap`. Fails with [`InitError::AlreadyInitialized`] if a heap
    /// has already been installed, in which case `heap` is dropped.
    pub fn init(&self, heap: Heap<'pool>) -> Result<(), InitError> {
        let _suspended = Suspended::new(&self.suspend);
        // A guard only exists for an installed heap
        if self.locked.get() {
            return Err(InitError::AlreadyInitialized);
        }
        // Safety: Protected by `suspend`, and no guard exists
        let inner = unsafe { &mut *self.inner.get() };
        if inner.is_some() {
            return Err(InitError::AlreadyInitialized);
        }
        log::debug!("heap: installed {:?}", heap);
        *inner = Some(heap);
        Ok(())
    }

    /// Check if [`Self::init`] has been called.
    pub fn is_initialized(&self) -> bool {
        self.read(|_| true)
    }

    /// Suspend other mutators and get exclusive access to the heap, e.g.,
    /// to read or write a payload.
    ///
    /// Fails with [`HeapFault::Uninitialized`] if the heap is uninitialized,
    /// or with [`HeapFault::Reentered`] if the calling task already holds a
    /// guard. The section lasts until the returned guard is dropped.
    pub fn lock(&self) -> Result<HeapGuard<'_, 'pool, S>, HeapFault> {
        let suspended = Suspended::new(&self.suspend);
        // Other tasks are suspended, so only the caller can have set this
        if self.locked.get() {
            return Err(HeapFault::Reentered);
        }
        // Safety: Protected by `suspend`, and no guard exists
        let heap = unsafe { &mut *self.inner.get() }
            .as_mut()
            .ok_or(HeapFault::Uninitialized)?;
        self.locked.set(true);
        Ok(HeapGuard {
            heap,
            locked: &self.locked,
            _suspended: suspended,
        })
    }

    /// Run `f` on the heap inside a [`SuspendAll::critical`] section. Returns
    /// `R::default()` if the heap is uninitialized.
    #[inline]
    fn read<R: Default>(&self, f: impl FnOnce(&Heap<'pool>) -> R) -> R {
        let result = self.suspend.critical(|| {
            if self.locked.get() {
                return Err(HeapFault::Reentered);
            }
            // Safety: Protected by `suspend`, and no guard exists
            Ok(unsafe { &*self.inner.get() }.as_ref().map(f))
        });
        match result {
            Ok(value) => value.unwrap_or_default(),
            Err(fault) => escalate(fault, panic_on_fault),
        }
    }

    /// Allocate a block with room for at least `wanted_size` bytes. See
    /// [`Heap::malloc`].
    ///
    /// [`HeapConfig::on_exhausted`](crate::HeapConfig::on_exhausted) is
    /// called after other mutators are resumed.
    pub fn malloc(&self, wanted_size: usize) -> Option<Allocation> {
        let (ptr, config, free_bytes) = match self.lock() {
            Ok(mut heap) => {
                let ptr = heap.allocate(wanted_size);
                (ptr, *heap.config(), heap.free_bytes_remaining())
            }
            Err(HeapFault::Uninitialized) => return None,
            Err(fault) => escalate(fault, panic_on_fault),
        };
        if ptr.is_none() {
            report_exhausted(&config, wanted_size, free_bytes);
        }
        ptr
    }

    /// Allocate a zero-filled array. See [`Heap::calloc`].
    pub fn calloc(&self, count: usize, element_size: usize) -> Option<Allocation> {
        let size = Heap::calloc_size(count, element_size)?;
        let (ptr, config, free_bytes) = match self.lock() {
            Ok(mut heap) => {
                let ptr = heap.allocate_zeroed(size);
                (ptr, *heap.config(), heap.free_bytes_remaining())
            }
            Err(HeapFault::Uninitialized) => return None,
            Err(fault) => escalate(fault, panic_on_fault),
        };
        if ptr.is_none() {
            report_exhausted(&config, size, free_bytes);
        }
        ptr
    }

    /// Return an allocation to the heap. Does nothing if `ptr` is `None`.
    /// See [`Heap::free`].
    ///
    /// The fault handler is invoked after other mutators are resumed.
    pub fn free(&self, ptr: Option<Allocation>) {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return,
        };

        let result = match self.lock() {
            Ok(mut heap) => heap
                .try_free(ptr)
                .map_err(|fault| (fault, heap.config().on_fault)),
            Err(fault) => Err((fault, panic_on_fault as fn(HeapFault) -> !)),
        };

        if let Err((fault, on_fault)) = result {
            escalate(fault, on_fault);
        }
    }

    /// See [`Heap::free_bytes_remaining`]. Returns `0` if the heap is
    /// uninitialized.
    pub fn free_bytes_remaining(&self) -> usize {
        self.read(Heap::free_bytes_remaining)
    }

    /// See [`Heap::minimum_ever_free_bytes_remaining`]. Returns `0` if the
    /// heap is uninitialized.
    pub fn minimum_ever_free_bytes_remaining(&self) -> usize {
        self.read(Heap::minimum_ever_free_bytes_remaining)
    }

    /// Take a snapshot of the heap's state. Returns all zeros if the heap is
    /// uninitialized.
    ///
    /// The free list is walked with other mutators suspended, and the
    /// counters are read afterwards in a separate critical section, so the
    /// two halves may straddle a concurrent operation.
    pub fn stats(&self) -> HeapStats {
        let summary = match self.lock() {
            Ok(heap) => heap.free_list_summary(),
            Err(HeapFault::Uninitialized) => return HeapStats::default(),
            Err(fault) => escalate(fault, panic_on_fault),
        };
        match self.read(|heap| Some(heap.counters())) {
            Some(counters) => HeapStats::from_parts(summary, counters),
            None => HeapStats::default(),
        }
    }
}

impl<S> fmt::Debug for LockedHeap<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedHeap").finish_non_exhaustive()
    }
}

/// Exclusive access to the heap of a [`LockedHeap`]. Other mutators stay
/// suspended until this is dropped.
///
/// Misuse detected by the panicking accessors ([`Heap::payload`],
/// [`Heap::payload_mut`], [`Heap::usable_size`]) reaches
/// [`HeapConfig::on_fault`](crate::HeapConfig::on_fault) while other
/// mutators are still suspended. Use [`Heap::try_payload`],
/// [`Heap::try_payload_mut`], or [`Heap::try_usable_size`] to handle it
/// after dropping the guard instead.
pub struct HeapGuard<'a, 'pool, S: SuspendAll> {
    heap: &'a mut Heap<'pool>,
    locked: &'a Cell<bool>,
    _suspended: Suspended<'a, S>,
}

impl<S: SuspendAll> Drop for HeapGuard<'_, '_, S> {
    #[inline]
    fn drop(&mut self) {
        // `_suspended` is dropped after this, so the section is still held
        self.locked.set(false);
    }
}

impl<'pool, S: SuspendAll> ops::Deref for HeapGuard<'_, 'pool, S> {
    type Target = Heap<'pool>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &*self.heap
    }
}

impl<'pool, S: SuspendAll> ops::DerefMut for HeapGuard<'_, 'pool, S> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.heap
    }
}
