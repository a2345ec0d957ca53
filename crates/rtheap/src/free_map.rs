//! Ordered index of the free blocks of a big page.
//!
//! The map is an AA tree keyed by `(size, addr)`, so several free blocks of
//! the same size coexist and [`FreeMap::find`] returns the smallest block at
//! least as large as the request (best fit, lowest address among equals).
//!
//! Tree nodes are allocated from a dedicated [`SmallFixPage`] placed at the
//! front of the big page, which bounds the number of free blocks a big page
//! can track. Links are `u32` offsets of the node payload from the start of
//! that page.
//!
//! All operations are *O(log n)*; the recursion depth is bounded by twice the
//! tree level.

use core::{ops::Range, ptr::NonNull};

use crate::{
    block::{BLOCK_OVERHEAD, Block, WORD_SIZE},
    error::ErrorCode,
    hooks::Reporter,
    page::MemoryPage,
    small_fix::SmallFixPage,
};

const NIL: u32 = u32::MAX;

#[repr(C)]
struct MapNode {
    size: usize,
    addr: usize,
    left: u32,
    right: u32,
    level: u32,
}

/// Bytes one map entry occupies in the map page.
pub const MAP_NODE_SIZE: usize = (BLOCK_OVERHEAD + size_of::<MapNode>()).next_multiple_of(WORD_SIZE);

#[derive(Debug)]
pub(crate) struct FreeMap {
    nodes: SmallFixPage,
    root: u32,
    len: usize,
}

impl FreeMap {
    /// Creates an empty map storing its nodes in `range`.
    pub(crate) fn new(range: Range<usize>) -> Self {
        Self {
            nodes: SmallFixPage::new(range, MAP_NODE_SIZE),
            root: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len >= self.capacity()
    }

    /// Bytes taken by the node storage.
    pub(crate) fn storage_size(&self) -> usize {
        self.nodes.base().span()
    }

    fn node(&self, link: u32) -> *mut MapNode {
        debug_assert_ne!(link, NIL);
        core::ptr::with_exposed_provenance_mut(self.nodes.base().start + link as usize)
    }

    fn key(&self, link: u32) -> (usize, usize) {
        let node = self.node(link);
        unsafe { ((*node).size, (*node).addr) }
    }

    fn left(&self, link: u32) -> u32 {
        if link == NIL {
            return NIL;
        }
        unsafe { (*self.node(link)).left }
    }

    fn right(&self, link: u32) -> u32 {
        if link == NIL {
            return NIL;
        }
        unsafe { (*self.node(link)).right }
    }

    fn level(&self, link: u32) -> u32 {
        if link == NIL {
            return 0;
        }
        unsafe { (*self.node(link)).level }
    }

    fn set_left(&mut self, link: u32, left: u32) {
        unsafe { (*self.node(link)).left = left }
    }

    fn set_right(&mut self, link: u32, right: u32) {
        unsafe { (*self.node(link)).right = right }
    }

    fn set_level(&mut self, link: u32, level: u32) {
        unsafe { (*self.node(link)).level = level }
    }

    fn set_key(&mut self, link: u32, (size, addr): (usize, usize)) {
        let node = self.node(link);
        unsafe {
            (*node).size = size;
            (*node).addr = addr;
        }
    }

    fn alloc_node(&mut self, key: (usize, usize), reporter: &Reporter<'_>) -> Option<u32> {
        let block = self.nodes.allocate_block(MAP_NODE_SIZE, reporter).ok()?;
        let offset = block.payload().as_ptr().addr() - self.nodes.base().start;
        #[expect(clippy::cast_possible_truncation)]
        let link = offset as u32;
        let (size, addr) = key;
        unsafe {
            self.node(link).write(MapNode {
                size,
                addr,
                left: NIL,
                right: NIL,
                level: 1,
            });
        }
        Some(link)
    }

    fn free_node(&mut self, link: u32, reporter: &Reporter<'_>) {
        let payload = NonNull::new(self.node(link).cast::<u8>());
        let block = payload.and_then(|payload| unsafe { Block::from_payload(payload) });
        if let Some(block) = block {
            // errors are reported by the node page
            let _ = self.nodes.free_block(block, reporter);
        }
    }

    fn skew(&mut self, t: u32) -> u32 {
        let l = self.left(t);
        if l != NIL && self.level(l) == self.level(t) {
            self.set_left(t, self.right(l));
            self.set_right(l, t);
            return l;
        }
        t
    }

    fn split(&mut self, t: u32) -> u32 {
        let r = self.right(t);
        if r != NIL && self.right(r) != NIL && self.level(self.right(r)) == self.level(t) {
            self.set_right(t, self.left(r));
            self.set_left(r, t);
            self.set_level(r, self.level(r) + 1);
            return r;
        }
        t
    }

    fn decrease_level(&mut self, t: u32) {
        let should_be = self.level(self.left(t)).min(self.level(self.right(t))) + 1;
        if should_be < self.level(t) {
            self.set_level(t, should_be);
            let r = self.right(t);
            if r != NIL && should_be < self.level(r) {
                self.set_level(r, should_be);
            }
        }
    }

    fn insert_at(&mut self, t: u32, node: u32) -> u32 {
        if t == NIL {
            return node;
        }
        if self.key(node) < self.key(t) {
            let l = self.insert_at(self.left(t), node);
            self.set_left(t, l);
        } else {
            let r = self.insert_at(self.right(t), node);
            self.set_right(t, r);
        }
        let t = self.skew(t);
        self.split(t)
    }

    fn delete_at(&mut self, t: u32, key: (usize, usize), removed: &mut u32) -> u32 {
        if t == NIL {
            return NIL;
        }
        let t_key = self.key(t);
        if key > t_key {
            let r = self.delete_at(self.right(t), key, removed);
            self.set_right(t, r);
        } else if key < t_key {
            let l = self.delete_at(self.left(t), key, removed);
            self.set_left(t, l);
        } else if self.left(t) == NIL && self.right(t) == NIL {
            *removed = t;
            return NIL;
        } else if self.left(t) == NIL {
            let mut succ = self.right(t);
            while self.left(succ) != NIL {
                succ = self.left(succ);
            }
            let succ_key = self.key(succ);
            let r = self.delete_at(self.right(t), succ_key, removed);
            self.set_right(t, r);
            self.set_key(t, succ_key);
        } else {
            let mut pred = self.left(t);
            while self.right(pred) != NIL {
                pred = self.right(pred);
            }
            let pred_key = self.key(pred);
            let l = self.delete_at(self.left(t), pred_key, removed);
            self.set_left(t, l);
            self.set_key(t, pred_key);
        }

        self.decrease_level(t);
        let t = self.skew(t);
        let r = self.skew(self.right(t));
        self.set_right(t, r);
        if r != NIL {
            let rr = self.skew(self.right(r));
            self.set_right(r, rr);
        }
        let t = self.split(t);
        let r = self.split(self.right(t));
        self.set_right(t, r);
        t
    }

    /// Adds a free block of `size` bytes at `addr`.
    ///
    /// Returns `false` if the node storage is exhausted.
    pub(crate) fn insert(&mut self, size: usize, addr: usize, reporter: &Reporter<'_>) -> bool {
        if self.is_full() {
            return false;
        }
        let Some(node) = self.alloc_node((size, addr), reporter) else {
            return false;
        };
        self.root = self.insert_at(self.root, node);
        self.len += 1;
        true
    }

    /// Removes the entry `(size, addr)`.
    ///
    /// Returns `false` if there is no such entry.
    pub(crate) fn del(&mut self, size: usize, addr: usize, reporter: &Reporter<'_>) -> bool {
        let mut removed = NIL;
        self.root = self.delete_at(self.root, (size, addr), &mut removed);
        if removed == NIL {
            return false;
        }
        self.free_node(removed, reporter);
        self.len -= 1;
        true
    }

    /// Smallest entry whose size is at least `size`, as `(size, addr)`.
    pub(crate) fn find(&self, size: usize) -> Option<(usize, usize)> {
        let mut best = None;
        let mut t = self.root;
        while t != NIL {
            let key = self.key(t);
            if key.0 >= size {
                best = Some(key);
                t = self.left(t);
            } else {
                t = self.right(t);
            }
        }
        best
    }

    pub(crate) fn exists(&self, size: usize, addr: usize) -> bool {
        let key = (size, addr);
        let mut t = self.root;
        while t != NIL {
            let t_key = self.key(t);
            if key == t_key {
                return true;
            }
            t = if key < t_key {
                self.left(t)
            } else {
                self.right(t)
            };
        }
        false
    }

    fn fold_at<F>(&self, t: u32, f: &mut F)
    where
        F: FnMut(usize, usize),
    {
        if t == NIL {
            return;
        }
        self.fold_at(self.left(t), f);
        let (size, addr) = self.key(t);
        f(size, addr);
        self.fold_at(self.right(t), f);
    }

    /// Visits all entries in ascending `(size, addr)` order.
    pub(crate) fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(usize, usize),
    {
        self.fold_at(self.root, &mut f);
    }

    pub(crate) fn total_size(&self) -> usize {
        let mut total = 0;
        self.for_each(|size, _| total += size);
        total
    }

    /// Checks the node storage and the AA level rules.
    pub(crate) fn check(&self) -> Result<(), ErrorCode> {
        self.nodes.check()?;
        if self.nodes.base().free_blocks + self.len
            != self.nodes.base().position.saturating_sub(self.nodes.base().start) / MAP_NODE_SIZE
        {
            return Err(ErrorCode::InvalidNumberOfFreeBlocks);
        }
        let mut count = 0;
        self.check_at(self.root, None, None, &mut count)?;
        if count != self.len {
            return Err(ErrorCode::InvalidNumberOfFreeBlocks);
        }
        Ok(())
    }

    fn check_at(
        &self,
        t: u32,
        lower: Option<(usize, usize)>,
        upper: Option<(usize, usize)>,
        count: &mut usize,
    ) -> Result<(), ErrorCode> {
        if t == NIL {
            return Ok(());
        }
        *count += 1;
        if *count > self.len {
            return Err(ErrorCode::InvalidNumberOfFreeBlocks);
        }
        let key = self.key(t);
        let (l, r) = (self.left(t), self.right(t));
        let level = self.level(t);
        let ordered = lower.is_none_or(|lower| lower < key) && upper.is_none_or(|upper| key < upper);
        let leveled = self.level(l) + 1 == level
            && (self.level(r) == level || self.level(r) + 1 == level)
            && self.level(self.right(r)) < level;
        if !ordered || !leveled {
            return Err(ErrorCode::InvalidBlock);
        }
        self.check_at(l, lower, Some(key), count)?;
        self.check_at(r, Some(key), upper, count)
    }
}
