//! Fixed-size chunk pages.
//!
//! All blocks of a small-fix page have the same size. Blocks are carved
//! lazily from a bump cursor and, once freed, recycled through a LIFO
//! [`FreeList`]; neither path ever splits or merges, so both allocation and
//! release are *O(1)*.

use core::ops::Range;

use crate::{
    block::{Block, WORD_SIZE},
    error::ErrorCode,
    free_list::{FreeList, MIN_FREE_BLOCK_SIZE},
    hooks::Reporter,
    page::{MemoryPage, PageBase},
};

#[derive(Debug)]
pub(crate) struct SmallFixPage {
    base: PageBase,
    chunk_size: usize,
    free_list: FreeList,
}

impl SmallFixPage {
    /// Creates an empty page of `chunk_size` blocks over `range`.
    pub(crate) fn new(range: Range<usize>, chunk_size: usize) -> Self {
        debug_assert!(chunk_size >= MIN_FREE_BLOCK_SIZE && chunk_size.is_multiple_of(WORD_SIZE));
        let base = PageBase::new(range.clone(), range.start);
        Self {
            base,
            chunk_size,
            free_list: FreeList::new(range.start),
        }
    }

    /// Number of chunks the page can hold.
    pub(crate) fn capacity(&self) -> usize {
        self.base.span() / self.chunk_size
    }

    fn allocate_block_at_current_pos(&mut self) -> Option<Block> {
        let end = self.base.position.checked_add(self.chunk_size)?;
        if end > self.base.end {
            return None;
        }
        let prev = self.base.last_block;
        let block = unsafe { Block::create(self.base.position, self.chunk_size, prev) };
        if let Some(prev) = prev {
            prev.clear_last();
        }
        block.set_last();
        self.base.last_block = Some(block);
        self.base.position = end;
        Some(block)
    }
}

impl MemoryPage for SmallFixPage {
    fn base(&self) -> &PageBase {
        &self.base
    }

    fn allocate_block(&mut self, size: usize, reporter: &Reporter<'_>) -> Result<Block, ErrorCode> {
        if size > self.chunk_size {
            reporter.failure(ErrorCode::BlockSizeNotAllowed);
            return Err(ErrorCode::BlockSizeNotAllowed);
        }

        let block = if let Some(block) = self.free_list.pop() {
            self.base.free_blocks -= 1;
            if !block.is_valid(&self.base.block_bounds())
                || !block.is_free()
                || block.size() != self.chunk_size
            {
                reporter.corruption(ErrorCode::InvalidBlock, block.addr());
                return Err(ErrorCode::InvalidBlock);
            }
            block
        } else if let Some(block) = self.allocate_block_at_current_pos() {
            block
        } else {
            reporter.failure(ErrorCode::OutOfMemory);
            return Err(ErrorCode::OutOfMemory);
        };

        block.set_allocated();
        if self.base.first_block.is_none_or(|first| block < first) {
            self.base.first_block = Some(block);
        }
        Ok(block)
    }

    fn free_block(&mut self, block: Block, reporter: &Reporter<'_>) -> Result<(), ErrorCode> {
        if block.size() != self.chunk_size {
            reporter.corruption(ErrorCode::InvalidBlock, block.addr());
            return Err(ErrorCode::InvalidBlock);
        }
        if block.is_free() {
            reporter.failure(ErrorCode::InvalidBlock);
            return Err(ErrorCode::InvalidBlock);
        }

        block.set_free();
        self.free_list.push(block);
        self.base.free_blocks += 1;
        // the marker moves on to the physical successor, which may itself be
        // free; it is only a hint
        if self.base.first_block == Some(block) {
            self.base.first_block = block.next();
        }
        Ok(())
    }

    fn tracked_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    fn tracked_free_bytes(&self) -> usize {
        self.free_list.total_size()
    }

    fn is_tracked(&self, block: Block) -> bool {
        self.free_list.contains(block)
    }

    fn overhead_bytes(&self) -> usize {
        self.base.end - self.base.position
    }

    fn max_blocks(&self) -> usize {
        self.capacity()
    }
}
