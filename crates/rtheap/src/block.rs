//! In-band block header and footer codec.
//!
//! Every block carries its metadata inside the arena:
//!
//! ```text
//! ┌─────────────────────────────┬──────────────────────┬────────────────┐
//! │ Header                      │ Payload              │ Footer         │
//! │ ┌───────────┬─────────────┐ │                      │ ┌────────────┐ │
//! │ │ size|flags│ prev: usize │ │                      │ │ size       │ │
//! │ └───────────┴─────────────┘ │                      │ └────────────┘ │
//! └─────────────────────────────┴──────────────────────┴────────────────┘
//! ```
//!
//! `size` covers the whole block including header and footer and is always a
//! multiple of the word size, so its two low bits hold [`BlockFlags`]. The
//! footer duplicates the masked size; a header whose size does not match the
//! footer is treated as corrupted. `prev` is the address of the physically
//! preceding block, or zero for the first block of a page.
//!
//! The raw size word never leaves this module.

use core::{fmt, ops::Range, ptr::NonNull};

use bitflags::bitflags;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = size_of::<usize>();

#[repr(C)]
struct BlockHeader {
    size: usize,
    prev: usize,
}

/// Bytes in front of the payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Bytes after the payload.
pub const FOOTER_SIZE: usize = WORD_SIZE;

/// Metadata bytes carried by every block.
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

bitflags! {
    /// Flags stored in the low bits of the header size word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BlockFlags: usize {
        /// The block is tracked by its page's free structure.
        const FREE = 1 << 0;
        /// The block is the physically last block of its page.
        const LAST = 1 << 1;
    }
}

const SIZE_MASK: usize = !BlockFlags::all().bits();

/// Rounds `size` up to the next multiple of the word size.
#[must_use]
pub const fn align_word(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(WORD_SIZE)
}

/// Handle to a block header inside the arena.
///
/// A `Block` is a plain address; it does not own the memory it points at.
/// Constructing one is `unsafe` because every accessor trusts that the
/// address refers to readable and writable arena memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block {
    header: NonNull<BlockHeader>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &self.size())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Block {
    /// Returns the block whose header starts at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `addr` is word aligned and that at least
    /// [`HEADER_SIZE`] bytes at `addr` belong to the arena for as long as the
    /// handle is used.
    pub(crate) unsafe fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(core::ptr::with_exposed_provenance_mut::<BlockHeader>(addr))
            .map(|header| Self { header })
    }

    /// Returns the block whose header starts at `addr`, which is never zero
    /// for arena memory.
    ///
    /// # Safety
    ///
    /// Same requirements as [`from_addr`](Self::from_addr), and `addr` must
    /// not be zero.
    pub(crate) unsafe fn from_arena_addr(addr: usize) -> Self {
        let header = core::ptr::with_exposed_provenance_mut::<BlockHeader>(addr);
        Self {
            header: unsafe { NonNull::new_unchecked(header) },
        }
    }

    /// Returns the block owning the payload at `ptr`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`from_addr`](Self::from_addr) for the address
    /// `ptr - HEADER_SIZE`.
    pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> Option<Self> {
        let addr = ptr.as_ptr().addr().checked_sub(HEADER_SIZE)?;
        unsafe { Self::from_addr(addr) }
    }

    /// Writes a fresh allocated, non-last block of `size` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// `addr..addr + size` must be word aligned, unused arena memory, so
    /// `addr` is not zero.
    pub(crate) unsafe fn create(addr: usize, size: usize, prev: Option<Self>) -> Self {
        debug_assert!(addr != 0 && addr.is_multiple_of(WORD_SIZE));
        debug_assert!(size.is_multiple_of(WORD_SIZE) && size >= BLOCK_OVERHEAD);
        let block = unsafe { Self::from_arena_addr(addr) };
        unsafe {
            block.header.write(BlockHeader {
                size,
                prev: prev.map_or(0, Self::addr),
            });
        }
        block.write_footer(size);
        block
    }

    fn raw(self) -> usize {
        unsafe { (*self.header.as_ptr()).size }
    }

    fn set_raw(self, raw: usize) {
        unsafe { (*self.header.as_ptr()).size = raw }
    }

    fn flags(self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.raw())
    }

    fn set_flags(self, flags: BlockFlags) {
        self.set_raw((self.raw() & SIZE_MASK) | flags.bits());
    }

    fn footer_addr(self, size: usize) -> usize {
        self.addr() + size - FOOTER_SIZE
    }

    fn read_footer(self, size: usize) -> usize {
        let footer = core::ptr::with_exposed_provenance::<usize>(self.footer_addr(size));
        unsafe { footer.read() }
    }

    fn write_footer(self, size: usize) {
        let footer = core::ptr::with_exposed_provenance_mut::<usize>(self.footer_addr(size));
        unsafe { footer.write(size) }
    }

    /// Address of the header.
    pub(crate) fn addr(self) -> usize {
        self.header.as_ptr().addr()
    }

    /// Address one past the footer.
    pub(crate) fn end(self) -> usize {
        self.addr() + self.size()
    }

    /// Pointer handed out to users.
    pub(crate) fn payload(self) -> NonNull<u8> {
        unsafe { self.header.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Bytes usable by the owner of the payload.
    pub(crate) fn payload_size(self) -> usize {
        self.size().saturating_sub(BLOCK_OVERHEAD)
    }

    pub(crate) fn size(self) -> usize {
        self.raw() & SIZE_MASK
    }

    /// Resizes the block, keeping its flags and rewriting the footer.
    pub(crate) fn set_size(self, size: usize) {
        debug_assert!(size.is_multiple_of(WORD_SIZE) && size > WORD_SIZE);
        self.set_raw(size | self.flags().bits());
        self.write_footer(size);
    }

    pub(crate) fn is_free(self) -> bool {
        self.flags().contains(BlockFlags::FREE)
    }

    pub(crate) fn set_free(self) {
        self.set_flags(self.flags() | BlockFlags::FREE);
    }

    pub(crate) fn set_allocated(self) {
        self.set_flags(self.flags() - BlockFlags::FREE);
    }

    pub(crate) fn is_last(self) -> bool {
        self.flags().contains(BlockFlags::LAST)
    }

    pub(crate) fn set_last(self) {
        self.set_flags(self.flags() | BlockFlags::LAST);
    }

    pub(crate) fn clear_last(self) {
        self.set_flags(self.flags() - BlockFlags::LAST);
    }

    /// Physically preceding block, `None` for the first block of a page.
    pub(crate) fn prev(self) -> Option<Self> {
        let prev = unsafe { (*self.header.as_ptr()).prev };
        unsafe { Self::from_addr(prev) }
    }

    pub(crate) fn set_prev(self, prev: Option<Self>) {
        unsafe { (*self.header.as_ptr()).prev = prev.map_or(0, Self::addr) }
    }

    /// Physically following block, `None` for the last block of a page.
    pub(crate) fn next(self) -> Option<Self> {
        if self.is_last() {
            return None;
        }
        unsafe { Self::from_addr(self.end()) }
    }

    /// Checks the header against the footer without leaving `bounds`.
    ///
    /// A block is valid when it lies inside `bounds`, is not its own
    /// predecessor, has a word-multiple size larger than one word and its
    /// footer repeats that size.
    pub(crate) fn is_valid(self, bounds: &Range<usize>) -> bool {
        let addr = self.addr();
        if !addr.is_multiple_of(WORD_SIZE) || !bounds.contains(&addr) {
            return false;
        }
        if addr.checked_add(HEADER_SIZE).is_none_or(|end| end > bounds.end) {
            return false;
        }
        let size = self.size();
        let prev = unsafe { (*self.header.as_ptr()).prev };
        if prev == addr || size <= WORD_SIZE || !size.is_multiple_of(WORD_SIZE) {
            return false;
        }
        match addr.checked_add(size) {
            Some(end) if end <= bounds.end => self.read_footer(size) == size,
            _ => false,
        }
    }

    /// Shrinks the block to `new_size` and turns the rest into a free block.
    ///
    /// Returns the new right-hand block. If this block was the last of its
    /// page, the new block inherits that role.
    pub(crate) fn split(self, new_size: usize) -> Self {
        let old_size = self.size();
        debug_assert!(new_size.is_multiple_of(WORD_SIZE));
        debug_assert!(new_size >= BLOCK_OVERHEAD && old_size - new_size >= BLOCK_OVERHEAD);

        let was_last = self.is_last();
        let next = self.next();
        self.set_size(new_size);

        let right = unsafe { Self::create(self.addr() + new_size, old_size - new_size, Some(self)) };
        right.set_free();
        if was_last {
            self.clear_last();
            right.set_last();
        } else if let Some(next) = next {
            next.set_prev(Some(right));
        }
        right
    }

    /// Splits the block into two equal halves and re-seats `self` on the
    /// right half.
    ///
    /// After the call `*self` is the new free right half and the returned
    /// block is the left half, which keeps the original address and free
    /// flag.
    pub(crate) fn halve_reseat_to_right(&mut self) -> Self {
        let left = *self;
        *self = left.split(left.size() / 2);
        left
    }

    /// Absorbs this block into its predecessor and returns the predecessor.
    ///
    /// The header of `self` is wiped. Returns `None` and changes nothing if
    /// the block has no predecessor.
    pub(crate) fn merge_left(self) -> Option<Self> {
        let prev = self.prev()?;
        let size = self.size();
        let was_last = self.is_last();
        let next = self.next();

        prev.set_size(prev.size() + size);
        if was_last {
            prev.set_last();
        } else if let Some(next) = next {
            next.set_prev(Some(prev));
        }
        self.wipe();
        Some(prev)
    }

    /// Absorbs the physical successor into this block.
    ///
    /// Returns `false` and changes nothing if this block is the last one.
    pub(crate) fn merge_right(self) -> bool {
        let Some(next) = self.next() else {
            return false;
        };
        let next_size = next.size();
        let next_was_last = next.is_last();
        let after = next.next();

        self.set_size(self.size() + next_size);
        if next_was_last {
            self.set_last();
        } else if let Some(after) = after {
            after.set_prev(Some(self));
        }
        next.wipe();
        true
    }

    fn wipe(self) {
        unsafe { self.header.write(BlockHeader { size: 0, prev: 0 }) }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_test_heap;

    fn bounds(start: *mut u8, size: usize) -> Range<usize> {
        start.addr()..start.addr() + size
    }

    #[test]
    fn test_align_word() {
        assert_eq!(align_word(0), Some(0));
        assert_eq!(align_word(1), Some(WORD_SIZE));
        assert_eq!(align_word(WORD_SIZE), Some(WORD_SIZE));
        assert_eq!(align_word(WORD_SIZE + 1), Some(2 * WORD_SIZE));
        assert_eq!(align_word(usize::MAX), None);
    }

    #[test]
    fn test_create_block() {
        with_test_heap(256, |start, size| unsafe {
            let block = Block::create(start.addr(), 64, None);
            assert_eq!(block.size(), 64);
            assert_eq!(block.end(), start.addr() + 64);
            assert!(!block.is_free());
            assert!(!block.is_last());
            assert!(block.prev().is_none());
            assert_eq!(block.payload().as_ptr(), start.add(HEADER_SIZE));
            assert_eq!(block.payload_size(), 64 - BLOCK_OVERHEAD);
            assert!(block.is_valid(&bounds(start, size)));

            let from_payload = Block::from_payload(block.payload()).unwrap();
            assert_eq!(from_payload, block);
            assert_eq!(Block::from_arena_addr(start.addr()), block);
            assert_eq!(Block::from_addr(start.addr()), Some(block));
            assert_eq!(Block::from_addr(0), None);
        });
    }

    #[test]
    fn test_flags_survive_resize() {
        with_test_heap(256, |start, size| unsafe {
            let block = Block::create(start.addr(), 128, None);
            block.set_free();
            block.set_last();
            block.set_size(96);
            assert_eq!(block.size(), 96);
            assert!(block.is_free());
            assert!(block.is_last());
            assert!(block.is_valid(&bounds(start, size)));

            block.set_allocated();
            assert!(!block.is_free());
            assert!(block.is_last());
            block.clear_last();
            assert!(!block.is_last());
            assert_eq!(block.size(), 96);
        });
    }

    #[test]
    fn test_footer_mismatch_is_invalid() {
        with_test_heap(256, |start, size| unsafe {
            let block = Block::create(start.addr(), 64, None);
            assert!(block.is_valid(&bounds(start, size)));

            start.add(64 - FOOTER_SIZE).cast::<usize>().write(48);
            assert!(!block.is_valid(&bounds(start, size)));
        });
    }

    #[test]
    fn test_out_of_bounds_is_invalid() {
        with_test_heap(256, |start, size| unsafe {
            let block = Block::create(start.addr(), 64, None);
            assert!(!block.is_valid(&bounds(start, 32)));
            block.set_size(256);
            assert!(block.is_valid(&bounds(start, size)));
            assert!(!block.is_valid(&(start.addr() + 8..start.addr() + size)));
        });
    }

    #[test]
    fn test_self_prev_is_invalid() {
        with_test_heap(256, |start, size| unsafe {
            let block = Block::create(start.addr(), 64, None);
            block.set_prev(Some(block));
            assert!(!block.is_valid(&bounds(start, size)));
        });
    }

    #[test]
    fn test_split_middle_block() {
        with_test_heap(512, |start, size| unsafe {
            let first = Block::create(start.addr(), 256, None);
            let second = Block::create(first.end(), 256, Some(first));
            second.set_last();

            let right = first.split(96);
            assert_eq!(first.size(), 96);
            assert_eq!(right.addr(), start.addr() + 96);
            assert_eq!(right.size(), 160);
            assert!(right.is_free());
            assert!(!right.is_last());
            assert_eq!(right.prev(), Some(first));
            assert_eq!(second.prev(), Some(right));
            assert_eq!(first.next(), Some(right));
            assert_eq!(right.next(), Some(second));

            let bounds = bounds(start, size);
            assert!(first.is_valid(&bounds));
            assert!(right.is_valid(&bounds));
            assert!(second.is_valid(&bounds));
        });
    }

    #[test]
    fn test_split_last_block() {
        with_test_heap(256, |start, size| unsafe {
            let block = Block::create(start.addr(), 256, None);
            block.set_last();

            let right = block.split(64);
            assert!(!block.is_last());
            assert!(right.is_last());
            assert_eq!(right.next(), None);
            assert!(right.is_valid(&bounds(start, size)));
        });
    }

    #[test]
    fn test_halve_reseats_to_right() {
        with_test_heap(256, |start, size| unsafe {
            let mut block = Block::create(start.addr(), 256, None);
            block.set_free();
            block.set_last();

            let left = block.halve_reseat_to_right();
            assert_eq!(left.addr(), start.addr());
            assert_eq!(left.size(), 128);
            assert!(left.is_free());
            assert!(!left.is_last());

            assert_eq!(block.addr(), start.addr() + 128);
            assert_eq!(block.size(), 128);
            assert!(block.is_free());
            assert!(block.is_last());
            assert_eq!(block.prev(), Some(left));

            let bounds = bounds(start, size);
            assert!(left.is_valid(&bounds));
            assert!(block.is_valid(&bounds));
        });
    }

    #[test]
    fn test_merge_left() {
        with_test_heap(384, |start, size| unsafe {
            let a = Block::create(start.addr(), 128, None);
            let b = Block::create(a.end(), 128, Some(a));
            let c = Block::create(b.end(), 128, Some(b));
            c.set_last();
            a.set_free();

            let merged = b.merge_left().unwrap();
            assert_eq!(merged, a);
            assert_eq!(a.size(), 256);
            assert!(a.is_free());
            assert_eq!(c.prev(), Some(a));
            assert_eq!(a.next(), Some(c));
            assert!(a.is_valid(&bounds(start, size)));
            assert_eq!(b.size(), 0);

            assert!(a.merge_left().is_none());
        });
    }

    #[test]
    fn test_merge_left_inherits_last() {
        with_test_heap(256, |start, _size| unsafe {
            let a = Block::create(start.addr(), 128, None);
            let b = Block::create(a.end(), 128, Some(a));
            b.set_last();

            let merged = b.merge_left().unwrap();
            assert!(merged.is_last());
            assert_eq!(merged.size(), 256);
        });
    }

    #[test]
    fn test_merge_right() {
        with_test_heap(384, |start, size| unsafe {
            let a = Block::create(start.addr(), 128, None);
            let b = Block::create(a.end(), 128, Some(a));
            let c = Block::create(b.end(), 128, Some(b));
            c.set_last();

            assert!(a.merge_right());
            assert_eq!(a.size(), 256);
            assert_eq!(c.prev(), Some(a));
            assert!(!a.is_last());

            assert!(a.merge_right());
            assert_eq!(a.size(), 384);
            assert!(a.is_last());
            assert!(a.is_valid(&bounds(start, size)));

            assert!(!a.merge_right());
        });
    }
}
