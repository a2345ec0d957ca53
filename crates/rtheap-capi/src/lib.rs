//! C interface over one process-wide [`Heap`].
//!
//! The functions are exported unmangled so that C code, or a firmware image
//! linking this crate, can call them directly. [`create_heap`] and
//! [`add_page`] take the process-wide heap exclusively. The allocation entry
//! points only share it, and each page serializes them with its own
//! [`Callbacks`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{
    ffi::{c_int, c_void},
    ptr,
};

use rtheap::{CorruptionPolicy, ErrorCode, Heap, HeapConfig, PageConfig, PageHooks, PageType};
use spin::RwLock;

// a panic must not unwind through the C boundary
static HEAP: RwLock<Heap<Callbacks>> =
    RwLock::new(Heap::new(HeapConfig::new(CorruptionPolicy::Continue)));

/// Optional page callbacks supplied by C code.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Callbacks {
    pub lock: Option<unsafe extern "C" fn()>,
    pub unlock: Option<unsafe extern "C" fn()>,
    /// Receives the numeric [`ErrorCode`].
    pub error: Option<unsafe extern "C" fn(code: u32)>,
}

impl PageHooks for Callbacks {
    fn lock(&self) {
        if let Some(lock) = self.lock {
            unsafe { lock() }
        }
    }

    fn unlock(&self) {
        if let Some(unlock) = self.unlock {
            unsafe { unlock() }
        }
    }

    fn on_error(&self, code: ErrorCode) {
        if let Some(error) = self.error {
            unsafe { error(code.into()) }
        }
    }
}

/// Hands `size` bytes at `start` to the heap, dropping all pages.
///
/// # Safety
///
/// The memory must stay valid and unused by anything else while the heap is
/// in use.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn create_heap(start: *mut c_void, size: usize) -> bool {
    unsafe { HEAP.write().init(start.cast(), size) }.is_ok()
}

/// Adds a page of `page_type` (the numeric [`PageType`]) to the heap.
///
/// `cb` may be null. `max_objects` sizes the free map of a big page, and
/// `min_block`/`max_block` bound the blocks of a power-two page; zero selects
/// the defaults.
///
/// # Safety
///
/// `cb` must be null or point to a valid [`Callbacks`]. When the heap is used
/// from more than one thread the callbacks must provide the lock; a call that
/// overlaps another on the same unlocked page fails with
/// [`ErrorCode::NoFreePage`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn add_page(
    cb: *const Callbacks,
    page_type: u32,
    size: usize,
    max_objects: usize,
    min_block: usize,
    max_block: usize,
) -> bool {
    let Some(page_type) = PageType::from_u32(page_type) else {
        log::warn!("unknown page type {page_type}");
        return false;
    };
    let hooks = unsafe { cb.as_ref() }.copied().unwrap_or_default();
    let config = PageConfig::new(page_type, size)
        .with_max_objects(max_objects)
        .with_block_range(min_block, max_block);
    HEAP.write().add_page(hooks, config).is_ok()
}

/// Allocates `size` bytes; returns null for zero or on failure.
#[unsafe(no_mangle)]
pub extern "C" fn heap_malloc(size: usize) -> *mut c_void {
    HEAP.read()
        .malloc(size)
        .map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

/// Releases a block; null and foreign pointers are ignored.
///
/// # Safety
///
/// `ptr` must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_free(ptr: *mut c_void) {
    unsafe { HEAP.read().free(ptr.cast()) }
}

/// Allocates `n * size` zeroed bytes.
#[unsafe(no_mangle)]
pub extern "C" fn heap_calloc(n: usize, size: usize) -> *mut c_void {
    HEAP.read()
        .calloc(n, size)
        .map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

/// Resizes a block; on failure the original block is kept and null returned.
///
/// # Safety
///
/// `ptr` must be null or a live block of this heap.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { HEAP.read().realloc(ptr.cast(), size) }
        .map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

/// Copies `n` bytes, checking heap blocks for size.
///
/// # Safety
///
/// Both ranges must be valid for `n` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    unsafe { HEAP.read().memcpy(dst.cast(), src.cast(), n) }
        .map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

/// Fills `n` bytes with `val` converted to `unsigned char`.
///
/// # Safety
///
/// `dst` must be valid for `n` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_memset(dst: *mut c_void, val: c_int, n: usize) -> *mut c_void {
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = val as u8;
    unsafe { HEAP.read().memset(dst.cast(), value, n) }
        .map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use rtheap::BLOCK_OVERHEAD;

    use super::*;

    static LOCKS: AtomicUsize = AtomicUsize::new(0);
    static UNLOCKS: AtomicUsize = AtomicUsize::new(0);
    static LAST_ERROR: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn count_lock() {
        LOCKS.fetch_add(1, Ordering::Relaxed);
    }

    unsafe extern "C" fn count_unlock() {
        UNLOCKS.fetch_add(1, Ordering::Relaxed);
    }

    unsafe extern "C" fn record_error(code: u32) {
        LAST_ERROR.store(code, Ordering::Relaxed);
    }

    #[test]
    fn test_c_interface() {
        let mut arena = vec![0_u64; 4096];
        let size = arena.len() * size_of::<u64>();
        let callbacks = Callbacks {
            lock: Some(count_lock),
            unlock: Some(count_unlock),
            error: Some(record_error),
        };

        unsafe {
            assert!(!add_page(ptr::null(), PageType::Fixed64 as u32, 4096, 0, 0, 0));
            assert!(create_heap(arena.as_mut_ptr().cast(), size));
            assert!(add_page(&raw const callbacks, PageType::Fixed64 as u32, 4096, 0, 0, 0));
            assert!(add_page(ptr::null(), PageType::Big as u32, 16384, 0, 0, 0));
            assert!(add_page(&raw const callbacks, PageType::PowerTwo as u32, 4096, 0, 32, 1024));
            assert!(!add_page(ptr::null(), 7, 4096, 0, 0, 0));
            assert!(!add_page(ptr::null(), PageType::Big as u32, 1 << 20, 0, 0, 0));

            assert!(heap_malloc(0).is_null());
            heap_free(ptr::null_mut());

            let small = heap_malloc(64 - BLOCK_OVERHEAD);
            assert!(!small.is_null());
            assert_eq!(LOCKS.load(Ordering::Relaxed), 1);

            let zeroed = heap_calloc(4, 8).cast::<u8>();
            assert!(!zeroed.is_null());
            assert!((0..32).all(|i| zeroed.add(i).read() == 0));

            assert_eq!(heap_memset(small, 0x7f, 8), small);
            assert_eq!(heap_memcpy(zeroed.cast(), small, 8), zeroed.cast());
            assert_eq!(zeroed.read(), 0x7f);
            assert!(heap_memset(small, 0, 64).is_null());

            let large = heap_realloc(small, 3000).cast::<u8>();
            assert!(!large.is_null());
            assert_eq!(large.add(7).read(), 0x7f);

            heap_free(large.cast());
            heap_free(zeroed.cast());
            assert!(heap_realloc(ptr::null_mut(), 0).is_null());

            // no 32-byte page, so this lands on the big page
            let tiny = heap_malloc(1);
            assert!(!tiny.is_null());
            heap_free(tiny);
            assert_eq!(LAST_ERROR.load(Ordering::Relaxed), 0);
            assert_eq!(
                LOCKS.load(Ordering::Relaxed),
                UNLOCKS.load(Ordering::Relaxed)
            );
        }
    }
}
