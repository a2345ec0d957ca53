//! Intrusive list of free blocks.
//!
//! The list nodes live in the payload of the free blocks themselves, so a
//! free list costs no memory beyond its head. Links are stored as `u32`
//! byte offsets from the owning page's start instead of pointers; an offset
//! that does not fit the page is never produced because pages are limited to
//! [`MAX_PAGE_SIZE`] bytes.
//!
//! ```text
//!  head
//!   │     ┌────────┬──────────────┬─────┐     ┌────────┬──────────────┬─────┐
//!   └───▶ │ header │ next │ prev  │ ... │ ──▶ │ header │ next │ prev  │ ... │
//!         └────────┴──────────────┴─────┘ ◀── └────────┴──────────────┴─────┘
//! ```
//!
//! Pushing and popping happen at the head, so the list behaves as a LIFO
//! stack. Removing an arbitrary member is *O(1)* as well.

use core::iter;

use crate::block::{BLOCK_OVERHEAD, Block, HEADER_SIZE, WORD_SIZE};

const NIL: u32 = u32::MAX;

#[repr(C)]
struct FreeLink {
    next: u32,
    prev: u32,
}

/// Largest page the offset encoding can address.
pub const MAX_PAGE_SIZE: usize = NIL as usize;

/// Smallest block that can be linked into a free list.
pub const MIN_FREE_BLOCK_SIZE: usize =
    (BLOCK_OVERHEAD + size_of::<FreeLink>()).next_multiple_of(WORD_SIZE);

#[derive(Debug)]
pub(crate) struct FreeList {
    base: usize,
    head: u32,
    len: usize,
}

impl FreeList {
    /// Creates an empty list whose offsets are relative to `base`.
    pub(crate) const fn new(base: usize) -> Self {
        Self {
            base,
            head: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn offset_of(&self, block: Block) -> u32 {
        let offset = block.addr() - self.base;
        debug_assert!(offset < MAX_PAGE_SIZE);
        #[expect(clippy::cast_possible_truncation)]
        let offset = offset as u32;
        offset
    }

    fn block_at(&self, offset: u32) -> Block {
        // offsets are relative to a page inside the arena
        unsafe { Block::from_arena_addr(self.base + offset as usize) }
    }

    fn link(&self, offset: u32) -> *mut FreeLink {
        core::ptr::with_exposed_provenance_mut(self.base + offset as usize + HEADER_SIZE)
    }

    /// Pushes `block` on top of the list.
    pub(crate) fn push(&mut self, block: Block) {
        debug_assert!(block.size() >= MIN_FREE_BLOCK_SIZE);
        let offset = self.offset_of(block);
        unsafe {
            self.link(offset).write(FreeLink {
                next: self.head,
                prev: NIL,
            });
            if self.head != NIL {
                (*self.link(self.head)).prev = offset;
            }
        }
        self.head = offset;
        self.len += 1;
    }

    /// Removes and returns the most recently pushed block.
    pub(crate) fn pop(&mut self) -> Option<Block> {
        if self.head == NIL {
            return None;
        }
        let offset = self.head;
        unsafe {
            let next = (*self.link(offset)).next;
            if next != NIL {
                (*self.link(next)).prev = NIL;
            }
            self.head = next;
        }
        self.len -= 1;
        Some(self.block_at(offset))
    }

    /// Unlinks `block` from the list.
    ///
    /// Returns `false` if `block` is detectably not a member: it claims to be
    /// the head but is not, or the list is empty.
    pub(crate) fn remove(&mut self, block: Block) -> bool {
        if self.is_empty() {
            return false;
        }
        let offset = self.offset_of(block);
        unsafe {
            let FreeLink { next, prev } = self.link(offset).read();
            if prev == NIL {
                if self.head != offset {
                    return false;
                }
                self.head = next;
            } else {
                (*self.link(prev)).next = next;
            }
            if next != NIL {
                (*self.link(next)).prev = prev;
            }
        }
        self.len -= 1;
        true
    }

    /// Iterates from the top of the list.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Block> + '_ {
        let mut offset = self.head;
        iter::from_fn(move || {
            if offset == NIL {
                return None;
            }
            let block = self.block_at(offset);
            offset = unsafe { (*self.link(offset)).next };
            Some(block)
        })
        .take(self.len)
    }

    pub(crate) fn contains(&self, block: Block) -> bool {
        self.iter().any(|b| b == block)
    }

    /// Sum of the sizes of all listed blocks.
    pub(crate) fn total_size(&self) -> usize {
        self.iter().map(Block::size).sum()
    }
}
