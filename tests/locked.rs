use ffheap::{
    Allocation, CriticalSection, Heap, HeapConfig, HeapFault, HeapStats, InitError, LockedHeap,
    SuspendAll,
};
use std::{
    panic,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

fn leak_buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

fn leak_heap<S: SuspendAll + Default>(len: usize) -> &'static LockedHeap<'static, S> {
    Box::leak(Box::new(LockedHeap::with_heap(
        Heap::new(leak_buffer(len)),
        S::default(),
    )))
}

/// A tiny xorshift generator so that every thread follows its own
/// reproducible sequence.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}

fn tag_of(thread: usize, i: usize) -> u8 {
    (thread * 31 + i) as u8
}

fn hammer<S: SuspendAll + Sync + 'static>(heap: &'static LockedHeap<'static, S>) {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 2000;

    let capacity = heap.lock().unwrap().capacity();

    let threads: Vec<_> = (0..THREADS)
        .map(|thread_i| {
            thread::spawn(move || {
                let mut rng = Rng(0x9e37_79b9 ^ (thread_i as u32 + 1));
                let mut live: Vec<(Allocation, usize, u8)> = Vec::new();

                for i in 0..ITERATIONS {
                    if live.len() < 16 && rng.next() % 3 != 0 {
                        let len = (rng.next() % 200) as usize + 1;
                        let ptr = if rng.next() % 2 == 0 {
                            heap.malloc(len)
                        } else {
                            heap.calloc(len, 1)
                        };
                        if let Some(ptr) = ptr {
                            let tag = tag_of(thread_i, i);
                            heap.lock().unwrap().payload_mut(ptr)[..len].fill(tag);
                            live.push((ptr, len, tag));
                        }
                    } else if !live.is_empty() {
                        let index = rng.next() as usize % live.len();
                        let (ptr, len, tag) = live.swap_remove(index);
                        {
                            let heap = heap.lock().unwrap();
                            assert!(
                                heap.payload(ptr)[..len].iter().all(|&b| b == tag),
                                "{:?} was overwritten",
                                ptr
                            );
                        }
                        heap.free(Some(ptr));
                    }
                }

                for (ptr, _, _) in live {
                    heap.free(Some(ptr));
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    let guard = heap.lock().unwrap();
    guard.check_integrity().unwrap();
    drop(guard);

    let stats = heap.stats();
    log::debug!("stats = {:?}", stats);
    assert_eq!(stats.free_block_count, 1);
    assert_eq!(stats.available_bytes, capacity);
    assert_eq!(stats.largest_free_block, capacity);
    assert_eq!(
        stats.successful_allocation_count,
        stats.successful_free_count
    );
    assert!(stats.successful_allocation_count > 0);
    assert!(heap.minimum_ever_free_bytes_remaining() < capacity);
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn threads_critical_section() {
    init_logger();
    hammer(leak_heap::<CriticalSection>(16 * 1024));
}

#[cfg(unix)]
#[test]
fn threads_pthread() {
    init_logger();
    hammer(leak_heap::<ffheap::PthreadSuspendAll>(16 * 1024));
}

#[test]
fn static_init() {
    static HEAP: LockedHeap<'static, CriticalSection> = LockedHeap::INIT;

    assert!(!HEAP.is_initialized());
    assert_eq!(HEAP.malloc(8), None);
    assert_eq!(HEAP.calloc(2, 4), None);
    assert_eq!(HEAP.free_bytes_remaining(), 0);
    assert_eq!(HEAP.stats(), HeapStats::default());
    assert_eq!(HEAP.lock().err(), Some(HeapFault::Uninitialized));
    HEAP.free(None);

    HEAP.init(Heap::new(leak_buffer(1024))).unwrap();
    assert!(HEAP.is_initialized());

    let capacity = HEAP.free_bytes_remaining();
    assert_eq!(
        HEAP.init(Heap::new(leak_buffer(1024))),
        Err(InitError::AlreadyInitialized)
    );
    // The first heap stays in place
    assert_eq!(HEAP.free_bytes_remaining(), capacity);

    let a = HEAP.malloc(100).unwrap();
    assert!(HEAP.free_bytes_remaining() < capacity);
    HEAP.free(Some(a));
    assert_eq!(HEAP.free_bytes_remaining(), capacity);
}

#[test]
#[should_panic(expected = "not initialized")]
fn free_uninitialized() {
    let heap: LockedHeap<'static, CriticalSection> = LockedHeap::INIT;
    heap.free(Allocation::from_offset(64));
}

#[test]
fn take_back() {
    let mut heap = LockedHeap::with_heap(Heap::new(leak_buffer(512)), CriticalSection::new());
    let a = heap.malloc(32).unwrap();
    let inner = heap.take().unwrap();
    assert!(!heap.is_initialized());
    assert!(inner.usable_size(a) >= 32);
}

#[test]
fn double_free_resumes_before_fault() {
    init_logger();
    let heap = LockedHeap::with_heap(Heap::new(leak_buffer(1024)), CriticalSection::new());

    let a = heap.malloc(64).unwrap();
    heap.free(Some(a));

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| heap.free(Some(a))));
    let message = *result.unwrap_err().downcast::<String>().unwrap();
    assert!(message.contains("double free"), "{}", message);

    // The section was left, and the heap is intact
    let b = heap.malloc(64).unwrap();
    assert_eq!(b, a);
    heap.lock().unwrap().check_integrity().unwrap();
}

#[cfg(unix)]
#[test]
fn out_of_memory_hook_runs_unlocked() {
    use ffheap::PthreadSuspendAll;

    static HEAP: LockedHeap<'static, PthreadSuspendAll> = LockedHeap::INIT;
    static FAILED: AtomicUsize = AtomicUsize::new(0);

    fn on_exhausted(wanted_size: usize) {
        // `PthreadSuspendAll` isn't reentrant, so this would deadlock if the
        // hook were called inside the section
        assert!(HEAP.free_bytes_remaining() < wanted_size);
        FAILED.fetch_add(1, Ordering::Relaxed);
    }

    let config = HeapConfig::INIT.with_on_exhausted(on_exhausted);
    HEAP.init(Heap::with_config(leak_buffer(1024), config))
        .unwrap();

    assert_eq!(HEAP.malloc(4096), None);
    assert_eq!(HEAP.calloc(1024, 4), None);
    assert_eq!(FAILED.load(Ordering::Relaxed), 2);

    // Overflowing `calloc` requests never reach the allocator
    assert_eq!(HEAP.calloc(usize::MAX, 2), None);
    assert_eq!(FAILED.load(Ordering::Relaxed), 2);
}

#[test]
fn stats_match_heap() {
    let heap = leak_heap::<CriticalSection>(2048);
    let a = heap.malloc(100).unwrap();
    let b = heap.malloc(200).unwrap();
    heap.free(Some(a));

    let expected = heap.lock().unwrap().stats();
    assert_eq!(heap.stats(), expected);
    assert_eq!(expected.free_block_count, 2);
    assert_eq!(expected.successful_allocation_count, 2);
    assert_eq!(expected.successful_free_count, 1);
    heap.free(Some(b));
}

#[test]
fn reentrant_use_is_refused() {
    init_logger();
    let heap = leak_heap::<CriticalSection>(1024);
    let a = heap.malloc(64).unwrap();

    let mut guard = heap.lock().unwrap();
    let before = guard.stats();

    assert_eq!(heap.lock().err(), Some(HeapFault::Reentered));
    assert_eq!(
        heap.init(Heap::new(leak_buffer(512))),
        Err(InitError::AlreadyInitialized)
    );

    let results = [
        panic::catch_unwind(panic::AssertUnwindSafe(|| {
            heap.malloc(64);
        })),
        panic::catch_unwind(panic::AssertUnwindSafe(|| {
            heap.calloc(4, 4);
        })),
        panic::catch_unwind(panic::AssertUnwindSafe(|| {
            heap.stats();
        })),
        panic::catch_unwind(panic::AssertUnwindSafe(|| {
            heap.free_bytes_remaining();
        })),
        panic::catch_unwind(panic::AssertUnwindSafe(|| heap.free(Some(a)))),
    ];
    for result in results {
        let message = *result.unwrap_err().downcast::<String>().unwrap();
        assert!(message.contains("already locked"), "{}", message);
    }

    // Nothing was touched behind the guard's back
    assert_eq!(guard.stats(), before);
    guard.payload_mut(a)[0] = 1;
    drop(guard);

    // The section was left, so other threads can enter again
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let b = heap.malloc(64);
        heap.free(b);
        tx.send(b.is_some()).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(true));

    heap.free(Some(a));
    assert_eq!(heap.stats().free_block_count, 1);
}
