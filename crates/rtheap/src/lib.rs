//! Deterministic paged heap for embedded and real-time targets.
//!
//! The heap manages one contiguous arena handed over by the host. The arena
//! is divided into up to [`MAX_PAGES`] pages, each governed by one allocation
//! strategy:
//!
//! ## Fixed pages ([`PageType::Fixed32`] .. [`PageType::Fixed512`])
//!
//! All blocks have the same size. Allocation and release are *O(1)*: blocks
//! are carved from a bump cursor and recycled through a LIFO free list.
//!
//! ## Power-two pages ([`PageType::PowerTwo`])
//!
//! Block sizes are powers of two within a configured range. Larger blocks are
//! halved on demand, and a freed block merges with a free buddy of the same
//! size. Lookups go through one free list per size class.
//!
//! ## Big pages ([`PageType::Big`])
//!
//! Variable-sized blocks served best fit from a balanced tree kept inside the
//! page. Freed blocks coalesce with both free neighbours.
//!
//! # Routing
//!
//! A request of `n` bytes becomes a block of `n + BLOCK_OVERHEAD` bytes
//! (rounded to the word size, and to a power of two when the heap has no big
//! page). The block goes to the page of its ideal fixed class if present,
//! otherwise to a big page, otherwise to the smallest fixed class that holds
//! it, otherwise to a power-two page. A request is never retried on another
//! page.
//!
//! # Usage
//!
//! ```rust
//! use rtheap::{Heap, HeapConfig, NoHooks, PageConfig, PageType};
//!
//! let mut arena = vec![0_u64; 4096];
//! let mut heap = Heap::<NoHooks>::new(HeapConfig::default());
//! unsafe { heap.init(arena.as_mut_ptr().cast(), arena.len() * 8) }.unwrap();
//! heap.add_page(NoHooks, PageConfig::new(PageType::Fixed64, 4096))
//!     .unwrap();
//! heap.add_page(NoHooks, PageConfig::big(16384)).unwrap();
//!
//! let small = heap.malloc(24).unwrap();
//! let large = heap.malloc(2000).unwrap();
//! unsafe {
//!     heap.free(large.as_ptr());
//!     heap.free(small.as_ptr());
//! }
//! assert_eq!(heap.check_integrity(), Ok(()));
//! ```
//!
//! # Concurrency
//!
//! Set-up ([`Heap::init`], [`Heap::add_page`]) takes `&mut self`. The
//! runtime operations take `&self` and lock only the page they touch, with
//! the [`PageHooks`] the page was added with, so an RTOS can plug in its own
//! mutex or interrupt masking and tasks using different pages never wait on
//! each other. [`SpinHooks`] wraps a spin lock. [`Heap`] is `Sync` when its
//! hooks are. A call that overlaps another on the same page, because the
//! hooks do not lock or because a hook reenters the heap, fails with
//! [`ErrorCode::NoFreePage`].
//!
//! [`LockedHeap`] wraps the heap in a reader-writer lock for use as the
//! global allocator: set-up writes, allocation reads.
//!
//! # Errors
//!
//! Set-up operations return [`HeapError`]. Runtime operations never unwind:
//! they return `None` and record an [`ErrorCode`], and page-level failures
//! are also passed to [`PageHooks::on_error`]. Detected corruption panics
//! under [`CorruptionPolicy::Abort`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod big;
mod block;
mod error;
mod free_list;
mod free_list_array;
mod free_map;
mod global;
mod heap;
mod hooks;
mod page;
mod power_two;
mod small_fix;
#[cfg(test)]
mod test_util;

pub use self::{
    big::{MIN_BLOCK_SIZE_FOR_SPLIT, SENTINEL_SIZE},
    block::{BLOCK_OVERHEAD, WORD_SIZE},
    error::{ErrorCode, HeapError, Location},
    free_list::{MAX_PAGE_SIZE, MIN_FREE_BLOCK_SIZE},
    free_list_array::MAX_BINS,
    free_map::MAP_NODE_SIZE,
    global::LockedHeap,
    heap::{ARENA_ALIGN, Heap, HeapConfig, MAX_PAGES},
    hooks::{CorruptionPolicy, NoHooks, PageHooks, SpinHooks},
    page::{PageConfig, PageStats, PageType},
    power_two::{MIN_POWER_TWO_BLOCK, MIN_POWER_TWO_MAX_BLOCK},
};
