//! Page bookkeeping shared by all allocation strategies.
//!
//! A page is a fixed sub-range of the arena governed by one strategy:
//!
//! - [`SmallFixPage`]: identical chunks, *O(1)* LIFO recycling.
//! - [`PowerTwoPage`]: power-of-two blocks with halving and buddy merging.
//! - [`BigPage`]: best-fit variable blocks with full coalescing.
//!
//! Pages are created once by [`Heap::add_page`](crate::Heap::add_page)
//! and never resized or removed.

use core::{
    cell::UnsafeCell,
    fmt,
    ops::Range,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    big::BigPage,
    block::Block,
    error::ErrorCode,
    hooks::{CorruptionPolicy, HookGuard, PageHooks, Reporter},
    power_two::PowerTwoPage,
    small_fix::SmallFixPage,
};

/// Allocation strategy and size class of a page.
///
/// The discriminants are used by the C interface.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    Fixed32 = 0,
    Fixed64 = 1,
    Fixed128 = 2,
    Fixed256 = 3,
    Fixed512 = 4,
    Big = 5,
    PowerTwo = 6,
}

impl PageType {
    /// Fixed-size classes in ascending order.
    pub const FIXED: [Self; 5] = [
        Self::Fixed32,
        Self::Fixed64,
        Self::Fixed128,
        Self::Fixed256,
        Self::Fixed512,
    ];

    /// Chunk size of a fixed class, header and footer included.
    #[must_use]
    pub const fn chunk_size(self) -> Option<usize> {
        match self {
            Self::Fixed32 => Some(32),
            Self::Fixed64 => Some(64),
            Self::Fixed128 => Some(128),
            Self::Fixed256 => Some(256),
            Self::Fixed512 => Some(512),
            Self::Big | Self::PowerTwo => None,
        }
    }

    /// Classifies a block size into the smallest fixed class holding it, or
    /// [`PageType::Big`] above 512 bytes.
    #[must_use]
    pub fn ideal_for(size: usize) -> Self {
        Self::FIXED
            .into_iter()
            .find(|class| class.chunk_size().is_some_and(|chunk| size <= chunk))
            .unwrap_or(Self::Big)
    }

    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        let page_type = match value {
            0 => Self::Fixed32,
            1 => Self::Fixed64,
            2 => Self::Fixed128,
            3 => Self::Fixed256,
            4 => Self::Fixed512,
            5 => Self::Big,
            6 => Self::PowerTwo,
            _ => return None,
        };
        Some(page_type)
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk_size() {
            Some(chunk) => write!(f, "fixed-{chunk}"),
            None if *self == Self::Big => f.write_str("big"),
            None => f.write_str("power-two"),
        }
    }
}

/// Parameters of [`Heap::add_page`](crate::Heap::add_page).
///
/// `max_objects` bounds the free map of a big page and the block chain of a
/// power-two page; zero selects a default derived from the page size.
/// `min_block_size` and `max_block_size` are only used by power-two pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageConfig {
    pub page_type: PageType,
    pub size: usize,
    pub max_objects: usize,
    pub min_block_size: usize,
    pub max_block_size: usize,
}

impl PageConfig {
    #[must_use]
    pub const fn new(page_type: PageType, size: usize) -> Self {
        Self {
            page_type,
            size,
            max_objects: 0,
            min_block_size: 0,
            max_block_size: 0,
        }
    }

    #[must_use]
    pub const fn big(size: usize) -> Self {
        Self::new(PageType::Big, size)
    }

    #[must_use]
    pub const fn power_two(size: usize, min_block_size: usize, max_block_size: usize) -> Self {
        Self::new(PageType::PowerTwo, size).with_block_range(min_block_size, max_block_size)
    }

    #[must_use]
    pub const fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    #[must_use]
    pub const fn with_block_range(mut self, min_block_size: usize, max_block_size: usize) -> Self {
        self.min_block_size = min_block_size;
        self.max_block_size = max_block_size;
        self
    }
}

/// Snapshot of a page's accounting.
///
/// `free_bytes + used_bytes + overhead_bytes == end - start` holds for every
/// consistent page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub page_type: PageType,
    pub start: usize,
    pub end: usize,
    /// Free blocks according to the page counter.
    pub free_blocks: usize,
    /// Bytes held by blocks on the page's free structure.
    pub free_bytes: usize,
    /// Bytes held by blocks handed out to users.
    pub used_bytes: usize,
    /// Bytes outside user-visible blocks: free map storage, sentinel, not yet
    /// carved bump space and tail slack.
    pub overhead_bytes: usize,
    /// First-block marker.
    pub first_block: Option<usize>,
    /// Physically last block.
    pub last_block: Option<usize>,
}

/// Range and cursors common to every page.
#[derive(Debug)]
pub(crate) struct PageBase {
    /// Whole page, including internal storage.
    pub(crate) start: usize,
    pub(crate) end: usize,
    /// Address of the first block of the physical chain.
    pub(crate) chain_start: usize,
    /// End of the carved part of the chain.
    pub(crate) position: usize,
    pub(crate) free_blocks: usize,
    pub(crate) first_block: Option<Block>,
    pub(crate) last_block: Option<Block>,
}

impl PageBase {
    pub(crate) fn new(range: Range<usize>, chain_start: usize) -> Self {
        debug_assert!(range.contains(&chain_start));
        Self {
            start: range.start,
            end: range.end,
            chain_start,
            position: chain_start,
            free_blocks: 0,
            first_block: None,
            last_block: None,
        }
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Range in which blocks of this page may live.
    pub(crate) fn block_bounds(&self) -> Range<usize> {
        self.chain_start..self.end
    }

    pub(crate) fn span(&self) -> usize {
        self.end - self.start
    }

    /// Walks the physical chain from the first block, stopping at the last
    /// block, at the first invalid block, or after `limit` blocks.
    pub(crate) fn blocks(&self, limit: usize) -> impl Iterator<Item = Block> + '_ {
        let bounds = self.block_bounds();
        let mut next = self
            .last_block
            .and_then(|_| unsafe { Block::from_addr(self.chain_start) });
        core::iter::from_fn(move || {
            let block = next.take().filter(|block| block.is_valid(&bounds))?;
            next = block.next();
            Some(block)
        })
        .take(limit)
    }
}

/// Operations every allocation strategy provides.
///
/// Implementations report every error they detect through the given
/// [`Reporter`] before returning it.
pub(crate) trait MemoryPage {
    fn base(&self) -> &PageBase;

    /// Hands out a block of at least `size` bytes, header and footer
    /// included.
    fn allocate_block(&mut self, size: usize, reporter: &Reporter<'_>) -> Result<Block, ErrorCode>;

    /// Returns an allocated block of this page to its free structure.
    fn free_block(&mut self, block: Block, reporter: &Reporter<'_>) -> Result<(), ErrorCode>;

    /// Number of entries in the free structure.
    fn tracked_free_blocks(&self) -> usize;

    /// Bytes held by the entries of the free structure.
    fn tracked_free_bytes(&self) -> usize;

    fn is_tracked(&self, block: Block) -> bool;

    fn overhead_bytes(&self) -> usize;

    /// Upper bound on the number of blocks in the physical chain.
    fn max_blocks(&self) -> usize;

    fn is_sentinel(&self, block: Block) -> bool {
        let _ = block;
        false
    }

    /// Walks the physical chain and cross-checks it with the free structure.
    fn check(&self) -> Result<(), ErrorCode> {
        let base = self.base();
        let bounds = base.block_bounds();
        let Some(last_block) = base.last_block else {
            return if self.tracked_free_blocks() == 0 && base.free_blocks == 0 {
                Ok(())
            } else {
                Err(ErrorCode::InvalidNumberOfFreeBlocks)
            };
        };

        let mut current = unsafe { Block::from_addr(base.chain_start) };
        let mut prev = None;
        let mut count = 0;
        let mut free = 0;
        while let Some(block) = current {
            count += 1;
            if count > self.max_blocks() {
                return Err(ErrorCode::InvalidBlockDistance);
            }
            if !block.is_valid(&bounds) {
                return Err(ErrorCode::InvalidBlock);
            }
            if block.prev() != prev {
                return Err(ErrorCode::InvalidBlockDistance);
            }
            if block.is_free() {
                if !self.is_tracked(block) {
                    return Err(ErrorCode::InvalidNumberOfFreeBlocks);
                }
                free += 1;
            }
            if block.is_last() {
                if block != last_block {
                    return Err(ErrorCode::InvalidBlock);
                }
                break;
            }
            prev = Some(block);
            current = block.next();
        }
        if current != Some(last_block) {
            return Err(ErrorCode::InvalidBlock);
        }
        if free != base.free_blocks || free != self.tracked_free_blocks() {
            return Err(ErrorCode::InvalidNumberOfFreeBlocks);
        }
        Ok(())
    }
}

pub(crate) enum PageKind {
    SmallFix(SmallFixPage),
    PowerTwo(PowerTwoPage),
    Big(BigPage),
}

impl PageKind {
    fn as_memory(&self) -> &dyn MemoryPage {
        match self {
            Self::SmallFix(page) => page,
            Self::PowerTwo(page) => page,
            Self::Big(page) => page,
        }
    }

    fn as_memory_mut(&mut self) -> &mut dyn MemoryPage {
        match self {
            Self::SmallFix(page) => page,
            Self::PowerTwo(page) => page,
            Self::Big(page) => page,
        }
    }
}

/// A page together with its hooks.
///
/// The strategy state is only touched inside the page's critical section,
/// so operations take `&self` and pages of one heap can be used from
/// different threads at once. The `busy` flag is held for the duration of
/// every operation: an overlapping call, from hooks that do not serialize or
/// from a hook reentering the heap, is refused instead of aliasing the
/// state.
pub(crate) struct Page<H> {
    page_type: PageType,
    index: usize,
    policy: CorruptionPolicy,
    range: Range<usize>,
    block_bounds: Range<usize>,
    hooks: H,
    busy: AtomicBool,
    kind: UnsafeCell<PageKind>,
}

// `kind` is only reached through `with_state`, which holds `busy`.
unsafe impl<H> Sync for Page<H> where H: Sync {}

impl<H> Page<H>
where
    H: PageHooks,
{
    pub(crate) fn new(
        page_type: PageType,
        index: usize,
        policy: CorruptionPolicy,
        hooks: H,
        kind: PageKind,
    ) -> Self {
        let base = kind.as_memory().base();
        let (range, block_bounds) = (base.start..base.end, base.block_bounds());
        Self {
            page_type,
            index,
            policy,
            range,
            block_bounds,
            hooks,
            busy: AtomicBool::new(false),
            kind: UnsafeCell::new(kind),
        }
    }

    pub(crate) fn page_type(&self) -> PageType {
        self.page_type
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.range.contains(&addr)
    }

    /// Runs `f` on the strategy state inside the page's critical section.
    fn with_state<T, F>(&self, f: F) -> Result<T, ErrorCode>
    where
        F: FnOnce(&mut dyn MemoryPage, &Reporter<'_>) -> Result<T, ErrorCode>,
    {
        let reporter = Reporter::new(&self.hooks, self.policy, self.index);
        let _guard = HookGuard::lock(&self.hooks);
        if self.busy.swap(true, Ordering::Acquire) {
            reporter.failure(ErrorCode::NoFreePage);
            return Err(ErrorCode::NoFreePage);
        }
        let page = unsafe { &mut *self.kind.get() }.as_memory_mut();
        let result = f(page, &reporter);
        self.busy.store(false, Ordering::Release);
        result
    }

    /// Returns the live block whose header is at the word-aligned `addr`.
    ///
    /// Anything else is refused without involving the hooks' error callback.
    /// Only valid inside the critical section: splitting or merging a
    /// neighbour rewrites the header.
    fn live_block(&self, addr: usize) -> Result<Block, ErrorCode> {
        unsafe { Block::from_addr(addr) }
            .filter(|block| block.is_valid(&self.block_bounds) && !block.is_free())
            .ok_or(ErrorCode::InvalidBlock)
    }

    /// Allocates a block of `size` bytes.
    pub(crate) fn allocate(&self, size: usize) -> Result<Block, ErrorCode> {
        let block = self.with_state(|page, reporter| page.allocate_block(size, reporter))?;
        log::trace!(
            "page {}: allocated {:#x} ({} bytes) for {size}",
            self.index,
            block.addr(),
            block.size()
        );
        Ok(block)
    }

    /// Frees the live block whose header is at `addr`.
    pub(crate) fn free(&self, addr: usize) -> Result<(), ErrorCode> {
        self.with_state(|page, reporter| {
            let block = self.live_block(addr)?;
            log::trace!("page {}: freeing {addr:#x} ({} bytes)", self.index, block.size());
            page.free_block(block, reporter)
        })
    }

    /// Block size of the live block whose header is at `addr`.
    pub(crate) fn block_size(&self, addr: usize) -> Result<usize, ErrorCode> {
        self.with_state(|_, _| self.live_block(addr).map(Block::size))
    }

    pub(crate) fn check(&self) -> Result<(), ErrorCode> {
        self.with_state(|page, _| {
            page.check().inspect_err(|code| {
                log::error!("page {}: integrity check failed: {code}", self.index);
                self.hooks.on_error(*code);
            })
        })
    }

    pub(crate) fn stats(&self) -> Result<PageStats, ErrorCode> {
        self.with_state(|page, _| {
            let base = page.base();
            let used_bytes = base
                .blocks(page.max_blocks())
                .filter(|block| !block.is_free() && !page.is_sentinel(*block))
                .map(Block::size)
                .sum();
            Ok(PageStats {
                page_type: self.page_type,
                start: base.start,
                end: base.end,
                free_blocks: base.free_blocks,
                free_bytes: page.tracked_free_bytes(),
                used_bytes,
                overhead_bytes: page.overhead_bytes(),
                first_block: base.first_block.map(Block::addr),
                last_block: base.last_block.map(Block::addr),
            })
        })
    }
}
