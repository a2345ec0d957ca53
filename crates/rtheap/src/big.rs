//! Best-fit pages for variable-size blocks.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┬──────────┐
//! │ map page     │ blocks                                   │ sentinel │
//! │ (tree nodes) │                                          │ (LAST)   │
//! └──────────────┴──────────────────────────────────────────┴──────────┘
//! ```
//!
//! Free blocks are indexed by a [`FreeMap`]. An allocation takes the
//! smallest free block that fits and splits off the remainder when it is
//! worth keeping. A release coalesces with both free neighbours. The
//! permanently allocated sentinel at the end of the page keeps the last
//! user block from ever being the physically last one.

use core::ops::Range;

use crate::{
    block::{Block, align_word},
    error::ErrorCode,
    free_list::MIN_FREE_BLOCK_SIZE,
    free_map::FreeMap,
    hooks::Reporter,
    page::{MemoryPage, PageBase},
};

/// Size of the block closing every big page.
pub const SENTINEL_SIZE: usize = 64;

/// A free remainder smaller than this stays attached to the allocation.
pub const MIN_BLOCK_SIZE_FOR_SPLIT: usize = 64;

#[derive(Debug)]
pub(crate) struct BigPage {
    base: PageBase,
    map: FreeMap,
    sentinel: Block,
}

impl BigPage {
    /// Smallest page holding a map of `map_size` bytes, one free block and
    /// the sentinel.
    pub(crate) const fn min_page_size(map_size: usize) -> Option<usize> {
        map_size.checked_add(MIN_FREE_BLOCK_SIZE + SENTINEL_SIZE)
    }

    /// Creates a page over `range` whose first `map_size` bytes store the
    /// free map.
    ///
    /// `range` must be at least [`min_page_size`](Self::min_page_size) bytes
    /// and the map must hold at least one entry.
    pub(crate) fn new(range: Range<usize>, map_size: usize, reporter: &Reporter<'_>) -> Self {
        debug_assert!(Self::min_page_size(map_size).is_some_and(|min| range.len() >= min));
        let blocks_start = range.start + map_size;
        let mut base = PageBase::new(range.clone(), blocks_start);
        let map = FreeMap::new(range.start..blocks_start);
        debug_assert!(map.capacity() > 0);

        let free = unsafe { Block::create(blocks_start, range.end - blocks_start - SENTINEL_SIZE, None) };
        free.set_free();
        let sentinel = unsafe { Block::create(free.end(), SENTINEL_SIZE, Some(free)) };
        sentinel.set_last();

        base.free_blocks = 1;
        base.first_block = Some(free);
        base.last_block = Some(sentinel);
        base.position = range.end;

        let mut page = Self {
            base,
            map,
            sentinel,
        };
        if !page.map.insert(free.size(), free.addr(), reporter) {
            page.base.free_blocks = 0;
            free.set_allocated();
            reporter.failure(ErrorCode::OutOfMemory);
        }
        page
    }

    fn unlink_free(&mut self, block: Block, reporter: &Reporter<'_>) -> bool {
        if !self.map.del(block.size(), block.addr(), reporter) {
            reporter.corruption(ErrorCode::InvalidNumberOfFreeBlocks, block.addr());
            return false;
        }
        self.base.free_blocks -= 1;
        true
    }

    fn link_free(&mut self, block: Block, reporter: &Reporter<'_>) -> bool {
        if !self.map.insert(block.size(), block.addr(), reporter) {
            return false;
        }
        self.base.free_blocks += 1;
        true
    }
}

impl MemoryPage for BigPage {
    fn base(&self) -> &PageBase {
        &self.base
    }

    fn allocate_block(&mut self, size: usize, reporter: &Reporter<'_>) -> Result<Block, ErrorCode> {
        let Some(size) = align_word(size.max(MIN_FREE_BLOCK_SIZE)) else {
            reporter.failure(ErrorCode::BlockSizeNotAllowed);
            return Err(ErrorCode::BlockSizeNotAllowed);
        };
        let Some((found_size, addr)) = self.map.find(size) else {
            reporter.failure(ErrorCode::OutOfMemory);
            return Err(ErrorCode::OutOfMemory);
        };

        let block = unsafe { Block::from_addr(addr) }
            .filter(|block| {
                block.is_valid(&self.base.block_bounds())
                    && block.is_free()
                    && block.size() == found_size
                    && *block != self.sentinel
            });
        let Some(block) = block else {
            reporter.corruption(ErrorCode::InvalidBlock, addr);
            return Err(ErrorCode::InvalidBlock);
        };
        if !self.unlink_free(block, reporter) {
            return Err(ErrorCode::InvalidNumberOfFreeBlocks);
        }

        // the entry just released leaves room for the remainder
        if found_size - size >= MIN_BLOCK_SIZE_FOR_SPLIT {
            let rest = block.split(size);
            if !self.link_free(rest, reporter) {
                reporter.corruption(ErrorCode::InvalidNumberOfFreeBlocks, rest.addr());
            }
        }
        block.set_allocated();
        Ok(block)
    }

    fn free_block(&mut self, block: Block, reporter: &Reporter<'_>) -> Result<(), ErrorCode> {
        if block == self.sentinel {
            reporter.corruption(ErrorCode::InvalidBlock, block.addr());
            return Err(ErrorCode::InvalidBlock);
        }
        if block.is_free() {
            reporter.failure(ErrorCode::InvalidBlock);
            return Err(ErrorCode::InvalidBlock);
        }

        let bounds = self.base.block_bounds();
        let mut block = block;
        let mut merged = false;

        if let Some(prev) = block.prev() {
            if !prev.is_valid(&bounds) || prev.end() != block.addr() {
                reporter.corruption(ErrorCode::InvalidBlockDistance, prev.addr());
            } else if prev.is_free() && self.unlink_free(prev, reporter) {
                if let Some(left) = block.merge_left() {
                    block = left;
                    merged = true;
                }
            }
        }

        if let Some(next) = block.next() {
            if !next.is_valid(&bounds) || next.prev() != Some(block) {
                reporter.corruption(ErrorCode::InvalidBlockDistance, next.addr());
            } else if next.is_free() && self.unlink_free(next, reporter) {
                merged |= block.merge_right();
            }
        }

        if !self.link_free(block, reporter) {
            // unreachable after a merge since every merge releases a map entry
            debug_assert!(!merged);
            reporter.failure(ErrorCode::OutOfMemory);
            return Err(ErrorCode::OutOfMemory);
        }
        block.set_free();

        if self.map.len() != self.base.free_blocks {
            reporter.corruption(ErrorCode::InvalidNumberOfFreeBlocks, block.addr());
            return Err(ErrorCode::InvalidNumberOfFreeBlocks);
        }
        Ok(())
    }

    fn tracked_free_blocks(&self) -> usize {
        self.map.len()
    }

    fn tracked_free_bytes(&self) -> usize {
        self.map.total_size()
    }

    fn is_tracked(&self, block: Block) -> bool {
        self.map.exists(block.size(), block.addr())
    }

    fn overhead_bytes(&self) -> usize {
        self.map.storage_size() + self.sentinel.size()
    }

    fn max_blocks(&self) -> usize {
        self.base.block_bounds().len() / MIN_FREE_BLOCK_SIZE + 1
    }

    fn is_sentinel(&self, block: Block) -> bool {
        block == self.sentinel
    }

    fn check(&self) -> Result<(), ErrorCode> {
        self.map.check()?;
        let base = self.base();
        if base.last_block != Some(self.sentinel) || !self.sentinel.is_last() {
            return Err(ErrorCode::InvalidBlock);
        }
        let bounds = base.block_bounds();
        let mut current = base.first_block;
        let mut prev = None;
        let mut free = 0;
        while let Some(block) = current {
            if !block.is_valid(&bounds) || block.prev() != prev {
                return Err(ErrorCode::InvalidBlockDistance);
            }
            if block.is_free() {
                if prev.is_some_and(Block::is_free) || !self.is_tracked(block) {
                    return Err(ErrorCode::InvalidNumberOfFreeBlocks);
                }
                free += 1;
            }
            if block.is_last() {
                break;
            }
            prev = Some(block);
            current = block.next();
        }
        if current != Some(self.sentinel) {
            return Err(ErrorCode::InvalidBlock);
        }
        if free != base.free_blocks || free != self.map.len() {
            return Err(ErrorCode::InvalidNumberOfFreeBlocks);
        }
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        free_map::MAP_NODE_SIZE,
        hooks::CorruptionPolicy,
        test_util::{RecordingHooks, with_test_heap},
    };

    fn map_size(entries: usize) -> usize {
        (entries * MAP_NODE_SIZE).next_multiple_of(16)
    }

    fn with_big_page<F>(size: usize, entries: usize, test_fn: F)
    where
        F: FnOnce(&mut BigPage, &Reporter<'_>, &RecordingHooks),
    {
        with_test_heap(size, |start, size| {
            let hooks = RecordingHooks::default();
            let reporter = Reporter::new(&hooks, CorruptionPolicy::Continue, 0);
            let mut page = BigPage::new(start.addr()..start.addr() + size, map_size(entries), &reporter);
            assert_eq!(page.check(), Ok(()));
            test_fn(&mut page, &reporter, &hooks);
        });
    }

    fn initial_free_size(page: &BigPage) -> usize {
        page.base.end - page.base.chain_start - SENTINEL_SIZE
    }

    #[test]
    fn test_initial_layout() {
        with_big_page(4096, 8, |page, _, hooks| {
            let free = page.base.first_block.unwrap();
            assert_eq!(free.addr(), page.base.start + map_size(8));
            assert_eq!(free.size(), 4096 - map_size(8) - SENTINEL_SIZE);
            assert!(free.is_free());
            assert_eq!(free.next(), Some(page.sentinel));
            assert!(page.sentinel.is_last());
            assert!(!page.sentinel.is_free());
            assert_eq!(page.base.free_blocks, 1);
            assert_eq!(page.map.len(), 1);
            assert_eq!(page.map.capacity(), 8);
            assert_eq!(
                page.tracked_free_bytes() + page.overhead_bytes(),
                page.base.span()
            );
            assert!(hooks.errors().is_empty());
        });
    }

    #[test]
    fn test_best_fit() {
        with_big_page(8192, 16, |page, reporter, hooks| {
            let a = page.allocate_block(1024, reporter).unwrap();
            let _p1 = page.allocate_block(128, reporter).unwrap();
            let c = page.allocate_block(2048, reporter).unwrap();
            let _p2 = page.allocate_block(128, reporter).unwrap();
            let e = page.allocate_block(512, reporter).unwrap();
            let _p3 = page.allocate_block(128, reporter).unwrap();
            for block in [a, c, e] {
                page.free_block(block, reporter).unwrap();
            }
            assert_eq!(page.base.free_blocks, 4);
            assert_eq!(page.check(), Ok(()));

            // 1024 is the smallest free block holding 600
            let block = page.allocate_block(600, reporter).unwrap();
            assert_eq!(block, a);
            assert_eq!(block.size(), 600);

            // a remainder of 48 bytes stays attached
            let block = page.allocate_block(2000, reporter).unwrap();
            assert_eq!(block, c);
            assert_eq!(block.size(), 2048);

            let block = page.allocate_block(512, reporter).unwrap();
            assert_eq!(block, e);
            assert_eq!(page.check(), Ok(()));
            assert!(hooks.errors().is_empty());
        });
    }

    #[test]
    fn test_merge_with_both_neighbours() {
        with_big_page(4096, 8, |page, reporter, hooks| {
            let whole = initial_free_size(page);
            let x = page.allocate_block(256, reporter).unwrap();
            let y = page.allocate_block(256, reporter).unwrap();
            let z = page.allocate_block(256, reporter).unwrap();

            page.free_block(x, reporter).unwrap();
            assert_eq!(page.base.free_blocks, 2);
            // merges right with the tail block
            page.free_block(z, reporter).unwrap();
            assert_eq!(page.base.free_blocks, 2);
            assert_eq!(page.check(), Ok(()));
            // merges left with `x` and right with `z`
            page.free_block(y, reporter).unwrap();
            assert_eq!(page.base.free_blocks, 1);
            assert_eq!(page.map.find(1), Some((whole, x.addr())));
            assert_eq!(x.next(), Some(page.sentinel));
            assert_eq!(page.sentinel.prev(), Some(x));
            assert_eq!(page.check(), Ok(()));
            assert!(hooks.errors().is_empty());
        });
    }

    #[test]
    fn test_small_remainder_not_split() {
        with_big_page(2048, 4, |page, reporter, hooks| {
            let whole = initial_free_size(page);
            let block = page.allocate_block(whole - 32, reporter).unwrap();
            assert_eq!(block.size(), whole);
            assert_eq!(page.base.free_blocks, 0);
            assert_eq!(
                page.allocate_block(32, reporter),
                Err(ErrorCode::OutOfMemory)
            );
            assert_eq!(hooks.errors(), [ErrorCode::OutOfMemory]);

            page.free_block(block, reporter).unwrap();
            assert_eq!(page.base.free_blocks, 1);
            assert_eq!(page.check(), Ok(()));
        });
    }

    #[test]
    fn test_full_map_keeps_block_allocated() {
        with_big_page(2048, 2, |page, reporter, hooks| {
            assert_eq!(page.map.capacity(), 2);
            let blocks = [0; 5].map(|_| page.allocate_block(128, reporter).unwrap());
            page.free_block(blocks[0], reporter).unwrap();
            assert!(page.map.is_full());

            assert_eq!(
                page.free_block(blocks[2], reporter),
                Err(ErrorCode::OutOfMemory)
            );
            assert!(!blocks[2].is_free());
            assert_eq!(hooks.errors(), [ErrorCode::OutOfMemory]);
            assert_eq!(page.check(), Ok(()));

            // freeing next to a free block needs no extra entry
            page.free_block(blocks[1], reporter).unwrap();
            assert_eq!(page.map.len(), 2);
            page.free_block(blocks[2], reporter).unwrap();
            assert_eq!(page.map.len(), 2);
            assert_eq!(page.check(), Ok(()));
        });
    }

    #[test]
    fn test_sentinel_free_is_corruption() {
        with_big_page(2048, 4, |page, reporter, hooks| {
            let sentinel = page.sentinel;
            assert_eq!(
                page.free_block(sentinel, reporter),
                Err(ErrorCode::InvalidBlock)
            );
            assert_eq!(hooks.errors(), [ErrorCode::InvalidBlock]);
            assert!(!sentinel.is_free());
            assert_eq!(page.check(), Ok(()));
        });
    }

    #[test]
    fn test_corrupted_free_block_detected() {
        with_big_page(2048, 4, |page, reporter, hooks| {
            let free = page.base.first_block.unwrap();
            free.set_size(free.size() - 64);
            assert_eq!(page.check(), Err(ErrorCode::InvalidNumberOfFreeBlocks));
            assert_eq!(
                page.allocate_block(128, reporter),
                Err(ErrorCode::InvalidBlock)
            );
            assert_eq!(hooks.errors(), [ErrorCode::InvalidBlock]);
        });
    }
}
