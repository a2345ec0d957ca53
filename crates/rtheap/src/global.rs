//! [`GlobalAlloc`] adapter.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    block::WORD_SIZE,
    heap::{Heap, HeapConfig},
    hooks::PageHooks,
};

/// A [`Heap`] behind a spin reader-writer lock, usable as
/// `#[global_allocator]`.
///
/// Set-up takes the write lock. Allocation only takes the read lock, so
/// calls on different pages run in parallel and each page is serialized by
/// its own hooks. Blocks are word aligned; layouts asking for a larger alignment are
/// refused with a null pointer.
pub struct LockedHeap<H> {
    heap: RwLock<Heap<H>>,
}

impl<H> LockedHeap<H>
where
    H: PageHooks,
{
    #[must_use]
    pub const fn new(config: HeapConfig) -> Self {
        Self {
            heap: RwLock::new(Heap::new(config)),
        }
    }

    /// Locks the heap exclusively, e.g. to initialize it and add pages.
    pub fn write(&self) -> RwLockWriteGuard<'_, Heap<H>> {
        self.heap.write()
    }

    /// Shares the heap, e.g. to read statistics.
    pub fn read(&self) -> RwLockReadGuard<'_, Heap<H>> {
        self.heap.read()
    }
}

unsafe impl<H> GlobalAlloc for LockedHeap<H>
where
    H: PageHooks + Send + Sync,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > WORD_SIZE {
            return ptr::null_mut();
        }
        self.heap
            .read()
            .malloc(layout.size())
            .map_or(ptr::null_mut(), |ptr| ptr.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.heap.read().free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > WORD_SIZE {
            return ptr::null_mut();
        }
        unsafe { self.heap.read().realloc(ptr, new_size) }
            .map_or(ptr::null_mut(), |ptr| ptr.as_ptr())
    }
}
