use core::{
    alloc::Layout,
    cell::{Cell, RefCell},
};
use std::vec::Vec;

use crate::{error::ErrorCode, hooks::PageHooks};

/// Runs `test_fn` on a freshly allocated, pattern-filled arena.
pub(crate) fn with_test_heap<F>(heap_size: usize, test_fn: F)
where
    F: FnOnce(*mut u8, usize),
{
    unsafe {
        let layout = Layout::from_size_align(heap_size, 16).unwrap();
        let heap_start = std::alloc::alloc(layout);
        assert!(!heap_start.is_null());
        heap_start.write_bytes(0x11, heap_size);
        let _ = heap_start.expose_provenance();
        test_fn(heap_start, heap_size);
        std::alloc::dealloc(heap_start, layout);
    }
}

/// Hooks that count lock calls and remember every reported error.
#[derive(Default)]
pub(crate) struct RecordingHooks {
    pub(crate) locks: Cell<usize>,
    pub(crate) unlocks: Cell<usize>,
    depth: Cell<usize>,
    errors: RefCell<Vec<ErrorCode>>,
}

impl RecordingHooks {
    pub(crate) fn errors(&self) -> Vec<ErrorCode> {
        self.errors.borrow().clone()
    }

    pub(crate) fn clear_errors(&self) {
        self.errors.borrow_mut().clear();
    }
}

impl PageHooks for RecordingHooks {
    fn lock(&self) {
        assert_eq!(self.depth.get(), 0, "page lock is not reentrant");
        self.depth.set(1);
        self.locks.set(self.locks.get() + 1);
    }

    fn unlock(&self) {
        assert_eq!(self.depth.get(), 1, "unlock without lock");
        self.depth.set(0);
        self.unlocks.set(self.unlocks.get() + 1);
    }

    fn on_error(&self, code: ErrorCode) {
        self.errors.borrow_mut().push(code);
    }
}
