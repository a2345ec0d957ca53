//! Power-of-two bins of free lists.
//!
//! Bin `i` holds free blocks of exactly `min_block_size << i` bytes, so the
//! bin of a block is `bit_width(size) - bit_width(min_block_size)`.

use arrayvec::ArrayVec;

use crate::{block::Block, free_list::FreeList};

/// Upper bound on the number of bins of one page.
pub const MAX_BINS: usize = usize::BITS as usize;

/// Number of significant bits in `n`.
pub(crate) const fn bit_width(n: usize) -> u32 {
    usize::BITS - n.leading_zeros()
}

#[derive(Debug)]
pub(crate) struct FreeListArray {
    bins: ArrayVec<FreeList, MAX_BINS>,
    min_width: u32,
}

impl FreeListArray {
    /// Creates one empty bin per power of two in
    /// `min_block_size..=max_block_size`.
    ///
    /// Both sizes must be powers of two with `min_block_size <= max_block_size`.
    pub(crate) fn new(base: usize, min_block_size: usize, max_block_size: usize) -> Self {
        debug_assert!(min_block_size.is_power_of_two() && max_block_size.is_power_of_two());
        debug_assert!(min_block_size <= max_block_size);
        let min_width = bit_width(min_block_size);
        let count = (bit_width(max_block_size) - min_width + 1) as usize;
        let bins = (0..count).map(|_| FreeList::new(base)).collect();
        Self { bins, min_width }
    }

    #[cfg(test)]
    pub(crate) fn bin_count(&self) -> usize {
        self.bins.len()
    }

    /// Bin of a block of exactly `size` bytes.
    fn bin_of(&self, size: usize) -> Option<usize> {
        if !size.is_power_of_two() {
            return None;
        }
        let index = bit_width(size).checked_sub(self.min_width)? as usize;
        (index < self.bins.len()).then_some(index)
    }

    /// Smallest bin whose blocks can hold `size` bytes.
    fn bin_for_request(&self, size: usize) -> Option<usize> {
        let min_block_size = 1_usize << (self.min_width - 1);
        let size = size.max(min_block_size).checked_next_power_of_two()?;
        self.bin_of(size)
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.iter().map(FreeList::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn bin_len(&self, size: usize) -> usize {
        self.bin_of(size).map_or(0, |index| self.bins[index].len())
    }

    /// Files `block` under the bin matching its size.
    ///
    /// Returns `false` if the block size has no bin.
    pub(crate) fn push(&mut self, block: Block) -> bool {
        let Some(index) = self.bin_of(block.size()) else {
            return false;
        };
        self.bins[index].push(block);
        true
    }

    /// Pops a block from the smallest non-empty bin able to hold `size`.
    pub(crate) fn pop(&mut self, size: usize) -> Option<Block> {
        let first = self.bin_for_request(size)?;
        self.bins[first..].iter_mut().find_map(FreeList::pop)
    }

    /// Unlinks `block` from the bin matching its size.
    pub(crate) fn remove(&mut self, block: Block) -> bool {
        self.bin_of(block.size())
            .is_some_and(|index| self.bins[index].remove(block))
    }

    pub(crate) fn contains(&self, block: Block) -> bool {
        self.bin_of(block.size())
            .is_some_and(|index| self.bins[index].contains(block))
    }

    pub(crate) fn total_size(&self) -> usize {
        self.bins.iter().map(FreeList::total_size).sum()
    }
}
