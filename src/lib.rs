//! This crate implements a first-fit, address-ordered, coalescing free-list
//! heap for microcontrollers running under a preemptive RTOS scheduler.
//!
//!  - **The memory pool is provided by an application.** The heap manages a
//!    single fixed-size buffer, typically a `static` array
//!    ([`HeapMemory`]). It can't grow the pool or return memory to the
//!    underlying system.
//!
//!  - **Adjacent free blocks are always coalesced.** The free list is kept in
//!    address order, and every block returned to it is merged with its
//!    neighbors on the spot.
//!
//!  - **Blocks are addressed by offsets.** Every header lives inside the pool
//!    and is accessed through bounds-checked accessors, so the allocator
//!    itself contains no pointer casts.
//!
//!  - **This crate supports `#![no_std]`.** Sharing a heap between tasks goes
//!    through [`LockedHeap`] and a [`SuspendAll`] provider supplied by the
//!    scheduler port.
//!
//! Allocation is best-effort first-fit: the free list is walked from the
//! lowest address, so the time it takes grows with the number of free blocks.
//!
//! # Examples
//!
//! ## `Heap`: Core API
//!
//! ```rust
//! use ffheap::Heap;
//!
//! let mut pool = [0u8; 1024];
//! let mut heap = Heap::new(&mut pool);
//!
//! let a = heap.malloc(100).unwrap();
//! heap.payload_mut(a)[..5].copy_from_slice(b"hello");
//! assert_eq!(&heap.payload(a)[..5], b"hello");
//!
//! heap.free(Some(a));
//! assert_eq!(heap.stats().free_block_count, 1);
//! ```
//!
//! ## `LockedHeap`: Shared Heap
//!
//! ```rust
//! use ffheap::{CriticalSection, Heap, HeapMemory, LockedHeap};
//!
//! static HEAP: LockedHeap<'static, CriticalSection> = LockedHeap::INIT;
//!
//! let memory: &'static mut HeapMemory<4096> = Box::leak(Box::new(HeapMemory::new()));
//! HEAP.init(Heap::new(memory.as_mut_slice())).unwrap();
//!
//! let a = HEAP.calloc(16, 4).unwrap();
//! HEAP.free(Some(a));
//! ```
//!
//! # Details
//!
//! ## Fatal misuse
//!
//! Freeing a block that is not currently allocated (double free, a forged
//! [`Allocation`], or a corrupted header) can't be recovered from, as the
//! free list can no longer be trusted. [`Heap::free`] hands such a
//! [`HeapFault`] to [`HeapConfig::on_fault`], which never returns. The default
//! handler panics. [`Heap::try_free`] performs the same validation but
//! reports the fault to the caller instead.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod config;
mod error;
mod heap;
mod locked;
mod stats;
mod suspend;
mod utils;
pub use self::{
    config::*,
    error::{HeapFault, InitError},
    heap::{Allocation, FreeBlock, FreeBlocks, Heap, HEADER_SIZE, MINIMUM_BLOCK_SIZE},
    locked::{HeapGuard, LockedHeap},
    stats::HeapStats,
    suspend::*,
};

#[cfg(any(test, feature = "std"))]
extern crate std;
