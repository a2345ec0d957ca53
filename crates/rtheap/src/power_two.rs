//! Power-of-two block pages.
//!
//! The page is tiled with power-of-two blocks at creation. An allocation
//! rounds the request up to a power of two, takes the smallest available
//! block and halves it until it fits, filing every right half under its bin.
//! A released block is merged at most once with each physical neighbour of
//! the same size, so the work per operation is bounded by the number of bins.
//!
//! ```text
//!  allocate(64) from a free 256 block:
//!
//!  ┌───────────────────────────────┐
//!  │              256              │
//!  └───────────────────────────────┘
//!  ┌───────────────┬───────────────┐
//!  │      128      │   128 (free)  │
//!  └───────────────┴───────────────┘
//!  ┌───────┬───────┬───────────────┐
//!  │64 used│64 free│   128 (free)  │
//!  └───────┴───────┴───────────────┘
//! ```

use core::ops::Range;

use crate::{
    block::Block,
    error::ErrorCode,
    free_list_array::{FreeListArray, bit_width},
    hooks::Reporter,
    page::{MemoryPage, PageBase},
};

/// Floor of the smallest block size of a power-two page.
pub const MIN_POWER_TWO_BLOCK: usize = 32;

/// Floor of the largest block size of a power-two page.
pub const MIN_POWER_TWO_MAX_BLOCK: usize = 64;

const fn prev_power_of_two(n: usize) -> usize {
    1 << (bit_width(n) - 1)
}

#[derive(Debug)]
pub(crate) struct PowerTwoPage {
    base: PageBase,
    bins: FreeListArray,
    min_block_size: usize,
    max_block_size: usize,
    /// Blocks in the physical chain.
    block_count: usize,
    max_blocks: usize,
}

impl PowerTwoPage {
    /// Creates a page over `range` tiled with free blocks.
    ///
    /// Both block sizes must be powers of two and `range` must hold at least
    /// one block of `min_block_size`. A nonzero `max_objects` caps the number
    /// of blocks in the chain, but never below the initial tiling; splits
    /// that would exceed the cap are refused.
    pub(crate) fn new(
        range: Range<usize>,
        min_block_size: usize,
        max_block_size: usize,
        max_objects: usize,
    ) -> Self {
        debug_assert!(min_block_size >= MIN_POWER_TWO_BLOCK);
        debug_assert!(max_block_size >= min_block_size);
        let base = PageBase::new(range.clone(), range.start);
        let max_blocks = range.len() / min_block_size;
        let mut page = Self {
            base,
            bins: FreeListArray::new(range.start, min_block_size, max_block_size),
            min_block_size,
            max_block_size,
            block_count: 0,
            max_blocks,
        };
        page.create_initial_free_blocks();
        if max_objects != 0 {
            page.max_blocks = max_objects.clamp(page.block_count, max_blocks);
        }
        page
    }

    /// Tiles the page greedily with the largest power of two that fits,
    /// capped at the maximum block size. A tail smaller than the minimum block
    /// size is left unused.
    fn create_initial_free_blocks(&mut self) {
        let mut pos = self.base.chain_start;
        let mut prev = None;
        while self.base.end - pos >= self.min_block_size {
            let size = prev_power_of_two(self.base.end - pos).min(self.max_block_size);
            let block = unsafe { Block::create(pos, size, prev) };
            block.set_free();
            self.bins.push(block);
            self.base.free_blocks += 1;
            self.block_count += 1;
            prev = Some(block);
            pos += size;
        }
        if let Some(last) = prev {
            last.set_last();
        }
        self.base.first_block = unsafe { Block::from_addr(self.base.chain_start) };
        self.base.last_block = prev;
        self.base.position = pos;
    }

    fn is_buddy(&self, neighbour: Block, block: Block) -> bool {
        neighbour.is_free()
            && neighbour.size() == block.size()
            && block.size() * 2 <= self.max_block_size
    }

    fn check_free_block(&self, block: Block, size: usize) -> bool {
        block.is_valid(&self.base.block_bounds())
            && block.is_free()
            && block.size().is_power_of_two()
            && block.size() >= size
    }
}

impl MemoryPage for PowerTwoPage {
    fn base(&self) -> &PageBase {
        &self.base
    }

    fn allocate_block(&mut self, size: usize, reporter: &Reporter<'_>) -> Result<Block, ErrorCode> {
        let target = Some(size)
            .filter(|size| *size >= self.min_block_size)
            .and_then(usize::checked_next_power_of_two)
            .filter(|target| *target <= self.max_block_size);
        let Some(target) = target else {
            reporter.failure(ErrorCode::BlockSizeNotAllowed);
            return Err(ErrorCode::BlockSizeNotAllowed);
        };

        let Some(mut block) = self.bins.pop(target) else {
            reporter.failure(ErrorCode::OutOfMemory);
            return Err(ErrorCode::OutOfMemory);
        };
        // popped either way, so the counter follows the bins
        self.base.free_blocks -= 1;
        if !self.check_free_block(block, target) {
            reporter.corruption(ErrorCode::InvalidBlock, block.addr());
            return Err(ErrorCode::InvalidBlock);
        }

        let splits = (block.size() / target).trailing_zeros() as usize;
        if self.block_count + splits > self.max_blocks {
            self.bins.push(block);
            self.base.free_blocks += 1;
            reporter.failure(ErrorCode::OutOfMemory);
            return Err(ErrorCode::OutOfMemory);
        }

        while block.size() > target {
            let mut right = block;
            block = right.halve_reseat_to_right();
            self.bins.push(right);
            self.base.free_blocks += 1;
            self.block_count += 1;
            if Some(block) == self.base.last_block {
                self.base.last_block = Some(right);
            }
        }
        block.set_allocated();
        Ok(block)
    }

    fn free_block(&mut self, block: Block, reporter: &Reporter<'_>) -> Result<(), ErrorCode> {
        if block.is_free() {
            reporter.failure(ErrorCode::InvalidBlock);
            return Err(ErrorCode::InvalidBlock);
        }
        if !block.size().is_power_of_two()
            || !(self.min_block_size..=self.max_block_size).contains(&block.size())
        {
            reporter.corruption(ErrorCode::InvalidBlock, block.addr());
            return Err(ErrorCode::InvalidBlock);
        }

        block.set_free();
        let mut block = block;

        if let Some(prev) = block.prev().filter(|prev| self.is_buddy(*prev, block)) {
            if self.bins.remove(prev) {
                self.base.free_blocks -= 1;
                self.block_count -= 1;
                let was_last = Some(block) == self.base.last_block;
                if let Some(merged) = block.merge_left() {
                    block = merged;
                }
                if was_last {
                    self.base.last_block = Some(block);
                }
            } else {
                reporter.corruption(ErrorCode::InvalidNumberOfFreeBlocks, prev.addr());
            }
        }

        if let Some(next) = block.next().filter(|next| self.is_buddy(*next, block)) {
            if self.bins.remove(next) {
                self.base.free_blocks -= 1;
                self.block_count -= 1;
                let was_last = Some(next) == self.base.last_block;
                block.merge_right();
                if was_last {
                    self.base.last_block = Some(block);
                }
            } else {
                reporter.corruption(ErrorCode::InvalidNumberOfFreeBlocks, next.addr());
            }
        }

        if !self.bins.push(block) {
            reporter.corruption(ErrorCode::InvalidBlock, block.addr());
            return Err(ErrorCode::InvalidBlock);
        }
        self.base.free_blocks += 1;
        Ok(())
    }

    fn tracked_free_blocks(&self) -> usize {
        self.bins.len()
    }

    fn tracked_free_bytes(&self) -> usize {
        self.bins.total_size()
    }

    fn is_tracked(&self, block: Block) -> bool {
        self.bins.contains(block)
    }

    fn overhead_bytes(&self) -> usize {
        self.base.end - self.base.position
    }

    fn max_blocks(&self) -> usize {
        self.max_blocks
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;
    use crate::{
        block::WORD_SIZE,
        hooks::{CorruptionPolicy, NoHooks},
        test_util::{RecordingHooks, with_test_heap},
    };

    fn sizes(page: &PowerTwoPage) -> Vec<(usize, bool)> {
        page.base
            .blocks(page.max_blocks())
            .map(|block| (block.size(), block.is_free()))
            .collect()
    }

    #[test]
    fn test_prev_power_of_two() {
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(96), 64);
        assert_eq!(prev_power_of_two(128), 128);
    }

    #[test]
    fn test_initial_tiling() {
        with_test_heap(1024 + 256 + 32 + 16, |start, size| {
            let page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 512, 0);
            assert_eq!(
                sizes(&page),
                [(512, true), (512, true), (256, true), (32, true)]
            );
            assert_eq!(page.base.free_blocks, 4);
            assert_eq!(page.overhead_bytes(), 16);
            assert_eq!(page.tracked_free_bytes(), size - 16);
            assert_eq!(page.check(), Ok(()));
        });
    }

    #[test]
    fn test_split_on_allocate() {
        with_test_heap(256, |start, size| {
            let hooks = RecordingHooks::default();
            let reporter = Reporter::new(&hooks, CorruptionPolicy::Continue, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 256, 0);

            let block = page.allocate_block(40, &reporter).unwrap();
            assert_eq!(block.addr(), start.addr());
            assert_eq!(block.size(), 64);
            assert_eq!(sizes(&page), [(64, false), (64, true), (128, true)]);
            assert_eq!(page.base.free_blocks, 2);
            assert_eq!(page.base.last_block.map(Block::size), Some(128));
            assert_eq!(page.check(), Ok(()));

            let small = page.allocate_block(32, &reporter).unwrap();
            assert_eq!(small.size(), 32);
            assert_eq!(small.addr(), start.addr() + 64);
            assert_eq!(page.check(), Ok(()));
            assert!(hooks.errors().is_empty());
        });
    }

    #[test]
    fn test_out_of_range_request_rejected() {
        with_test_heap(1024, |start, size| {
            let hooks = RecordingHooks::default();
            let reporter = Reporter::new(&hooks, CorruptionPolicy::Continue, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 64, 256, 0);
            assert_eq!(
                page.allocate_block(257, &reporter),
                Err(ErrorCode::BlockSizeNotAllowed)
            );
            assert_eq!(
                page.allocate_block(33, &reporter),
                Err(ErrorCode::BlockSizeNotAllowed)
            );
            assert_eq!(
                hooks.errors(),
                [ErrorCode::BlockSizeNotAllowed, ErrorCode::BlockSizeNotAllowed]
            );
            assert_eq!(page.base.free_blocks, 4);
            assert_eq!(page.check(), Ok(()));
        });
    }

    #[test]
    fn test_split_beyond_initial_blocks() {
        with_test_heap(4096, |start, size| {
            let reporter = Reporter::new(&NoHooks, CorruptionPolicy::Abort, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 1024, 0);
            assert_eq!(page.max_blocks(), 128);
            assert_eq!(page.base.free_blocks, 4);

            let block = page.allocate_block(32, &reporter).unwrap();
            assert_eq!(block.size(), 32);
            // three untouched 1024 blocks and the halves of the fourth
            assert_eq!(sizes(&page).len(), 9);
            assert_eq!(page.check(), Ok(()));
            assert_eq!(
                sizes(&page)
                    .iter()
                    .filter(|(_, free)| !free)
                    .map(|(size, _)| size)
                    .sum::<usize>(),
                32
            );
        });
    }

    #[test]
    fn test_max_objects_caps_splits() {
        with_test_heap(4096, |start, size| {
            let hooks = RecordingHooks::default();
            let reporter = Reporter::new(&hooks, CorruptionPolicy::Continue, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 1024, 6);
            assert_eq!(page.max_blocks(), 6);

            let a = page.allocate_block(512, &reporter).unwrap();
            let b = page.allocate_block(256, &reporter).unwrap();
            assert_eq!(page.block_count, 6);
            assert_eq!(
                page.allocate_block(128, &reporter),
                Err(ErrorCode::OutOfMemory)
            );
            assert_eq!(hooks.errors(), [ErrorCode::OutOfMemory]);
            // the refused block went back to its bin
            assert_eq!(page.base.free_blocks, 4);
            assert_eq!(page.check(), Ok(()));

            page.free_block(b, &reporter).unwrap();
            page.free_block(a, &reporter).unwrap();
            assert_eq!(page.block_count, 4);
            assert_eq!(page.check(), Ok(()));

            // a cap below the initial tiling is raised to it
            let page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 1024, 1);
            assert_eq!(page.max_blocks(), 4);
        });
    }

    #[test]
    fn test_corrupted_free_block_leaves_counter_in_step() {
        with_test_heap(256, |start, size| {
            let hooks = RecordingHooks::default();
            let reporter = Reporter::new(&hooks, CorruptionPolicy::Continue, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 128, 0);

            // clobber the footer of the second 128 block, the top of its bin
            unsafe { start.add(256 - WORD_SIZE).cast::<usize>().write(0) };
            assert_eq!(
                page.allocate_block(128, &reporter),
                Err(ErrorCode::InvalidBlock)
            );
            assert_eq!(hooks.errors(), [ErrorCode::InvalidBlock]);
            assert_eq!(page.base.free_blocks, 1);
            assert_eq!(page.base.free_blocks, page.tracked_free_blocks());
        });
    }

    #[test]
    fn test_buddy_coalescing() {
        with_test_heap(256, |start, size| {
            let hooks = RecordingHooks::default();
            let reporter = Reporter::new(&hooks, CorruptionPolicy::Continue, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 256, 0);

            let a = page.allocate_block(64, &reporter).unwrap();
            let b = page.allocate_block(64, &reporter).unwrap();
            assert_eq!(b.addr(), a.end());
            assert_eq!(sizes(&page), [(64, false), (64, false), (128, true)]);

            page.free_block(a, &reporter).unwrap();
            assert_eq!(sizes(&page), [(64, true), (64, false), (128, true)]);

            // merges left with `a`, then right with the 128 block
            page.free_block(b, &reporter).unwrap();
            assert_eq!(sizes(&page), [(256, true)]);
            assert_eq!(page.base.free_blocks, 1);
            assert_eq!(page.base.last_block.map(Block::addr), Some(start.addr()));
            assert_eq!(page.check(), Ok(()));

            let whole = page.allocate_block(256, &reporter).unwrap();
            assert_eq!(whole.addr(), start.addr());
            assert!(hooks.errors().is_empty());
        });
    }

    #[test]
    fn test_merge_is_capped_by_max_block_size() {
        with_test_heap(256, |start, size| {
            let reporter = Reporter::new(&NoHooks, CorruptionPolicy::Abort, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 128, 0);
            assert_eq!(sizes(&page), [(128, true), (128, true)]);

            let a = page.allocate_block(128, &reporter).unwrap();
            page.free_block(a, &reporter).unwrap();
            assert_eq!(sizes(&page), [(128, true), (128, true)]);
            assert_eq!(page.check(), Ok(()));
        });
    }

    #[test]
    fn test_free_counter_matches_bins() {
        with_test_heap(2048, |start, size| {
            let reporter = Reporter::new(&NoHooks, CorruptionPolicy::Abort, 0);
            let mut page = PowerTwoPage::new(start.addr()..start.addr() + size, 32, 1024, 0);
            let blocks = [40, 100, 32, 500, 64, 33_usize]
                .into_iter()
                .map(|size| page.allocate_block(size, &reporter).unwrap())
                .collect::<Vec<_>>();
            assert_eq!(page.check(), Ok(()));
            for block in blocks.into_iter().rev() {
                page.free_block(block, &reporter).unwrap();
                assert_eq!(page.base.free_blocks, page.tracked_free_blocks());
                assert_eq!(page.check(), Ok(()));
            }
            assert_eq!(page.tracked_free_bytes(), size);
        });
    }
}
