//! The arena and its page table.
//!
//! A [`Heap`] owns one contiguous arena supplied by the host. Pages are
//! carved from the front of the remaining arena by [`Heap::add_page`] and
//! stay for the life of the heap. Every allocation request is routed to
//! exactly one page; nothing is retried on another page.
//!
//! Set-up takes `&mut self`. Once the pages are in place, the runtime
//! operations take `&self` and only enter the critical section of the page
//! they touch.

use core::{
    fmt,
    ops::Range,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};

use arrayvec::ArrayVec;
use snafu::ensure;

use crate::{
    big::BigPage,
    block::{BLOCK_OVERHEAD, HEADER_SIZE, WORD_SIZE, align_word},
    error::{
        ArenaTooSmallSnafu, BlockRangeSnafu, ErrorCode, HeapError, MapPageTooSmallSnafu,
        NotInitializedSnafu, OutOfArenaSnafu, PageSizeSnafu, PageTableFullSnafu,
        PageTooLargeSnafu,
    },
    free_list::MAX_PAGE_SIZE,
    free_map::MAP_NODE_SIZE,
    hooks::{CorruptionPolicy, NoHooks, PageHooks, Reporter},
    page::{Page, PageConfig, PageKind, PageStats, PageType},
    power_two::{MIN_POWER_TWO_BLOCK, MIN_POWER_TWO_MAX_BLOCK, PowerTwoPage},
    small_fix::SmallFixPage,
};

/// Capacity of the page table.
pub const MAX_PAGES: usize = 16;

/// Alignment of the arena start and of every page boundary.
pub const ARENA_ALIGN: usize = 2 * WORD_SIZE;

const BIG_PAGE_BYTES_PER_OBJECT: usize = 512;
const MIN_BIG_PAGE_OBJECTS: usize = 8;

/// Heap-wide settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapConfig {
    pub corruption_policy: CorruptionPolicy,
}

impl HeapConfig {
    #[must_use]
    pub const fn new(corruption_policy: CorruptionPolicy) -> Self {
        Self { corruption_policy }
    }
}

/// A paged heap over a caller-supplied arena.
///
/// All bookkeeping lives either inside the arena or in the fixed-size page
/// table of this struct; the heap never allocates from anywhere else.
///
/// The heap is `Sync` when its hooks are. Calls that reach different pages
/// then run in parallel, and calls on the same page are serialized by that
/// page's hooks. A page entered by an overlapping call that its hooks let
/// through, such as with [`NoHooks`], refuses the call with
/// [`ErrorCode::NoFreePage`].
pub struct Heap<H = NoHooks> {
    arena: Range<usize>,
    cursor: usize,
    pages: ArrayVec<Page<H>, MAX_PAGES>,
    config: HeapConfig,
    last_error: AtomicU32,
}

// The heap holds arena addresses, which are only dereferenced through
// `&mut self` or inside a page's critical section.
unsafe impl<H> Send for Heap<H> where H: Send {}

impl<H> fmt::Debug for Heap<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field(
                "arena",
                &format_args!("{:#x}..{:#x}", self.arena.start, self.arena.end),
            )
            .field("cursor", &format_args!("{:#x}", self.cursor))
            .field("pages", &self.pages.len())
            .field("config", &self.config)
            .field(
                "last_error",
                &ErrorCode::from_u32(self.last_error.load(Ordering::Relaxed)).unwrap_or_default(),
            )
            .finish()
    }
}

impl<H> Default for Heap<H>
where
    H: PageHooks,
{
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

impl<H> Heap<H>
where
    H: PageHooks,
{
    /// Creates an uninitialized heap.
    #[must_use]
    pub const fn new(config: HeapConfig) -> Self {
        Self {
            arena: 0..0,
            cursor: 0,
            pages: ArrayVec::new_const(),
            config,
            last_error: AtomicU32::new(ErrorCode::Ok.as_u32()),
        }
    }

    /// Takes over `size` bytes at `start` as the arena.
    ///
    /// The arena is shrunk to [`ARENA_ALIGN`] boundaries and zeroed. Any
    /// previously added pages are forgotten.
    ///
    /// # Safety
    ///
    /// `start..start + size` must be writable memory that is not used by
    /// anything else for as long as this heap or any pointer it hands out is
    /// in use.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) -> Result<(), HeapError> {
        let result = unsafe { self.try_init(start, size) };
        self.record(result)
    }

    unsafe fn try_init(&mut self, start: *mut u8, size: usize) -> Result<(), HeapError> {
        let addr = start.expose_provenance();
        ensure!(addr != 0, ArenaTooSmallSnafu { size });
        let Some(aligned_start) = addr.checked_next_multiple_of(ARENA_ALIGN) else {
            return ArenaTooSmallSnafu { size }.fail();
        };
        let offset = aligned_start - addr;
        let aligned_size = size.saturating_sub(offset) & !(ARENA_ALIGN - 1);
        ensure!(aligned_size > 0, ArenaTooSmallSnafu { size });

        unsafe { start.add(offset).write_bytes(0, aligned_size) };
        self.arena = aligned_start..aligned_start + aligned_size;
        self.cursor = aligned_start;
        self.pages.clear();
        log::debug!(
            "heap arena {:#x}..{:#x} ({aligned_size} bytes)",
            self.arena.start,
            self.arena.end
        );
        Ok(())
    }

    fn record<T>(&self, result: Result<T, HeapError>) -> Result<T, HeapError> {
        match &result {
            Ok(_) => self.set_last_error(ErrorCode::Ok),
            Err(err) => {
                log::warn!("{err} ({})", err.location());
                self.set_last_error(err.code());
            }
        }
        result
    }

    fn set_last_error(&self, code: ErrorCode) {
        self.last_error.store(code.as_u32(), Ordering::Relaxed);
    }

    /// Records the outcome of a runtime operation.
    fn finish<T>(&self, result: Result<T, ErrorCode>) -> Option<T> {
        match result {
            Ok(value) => {
                self.set_last_error(ErrorCode::Ok);
                Some(value)
            }
            Err(code) => {
                self.set_last_error(code);
                None
            }
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.arena.is_empty()
    }

    /// Carves a new page from the front of the remaining arena.
    ///
    /// The page size is rounded up to [`ARENA_ALIGN`]. `hooks` guard every
    /// allocation and release on the page and receive its errors.
    pub fn add_page(&mut self, hooks: H, config: PageConfig) -> Result<(), HeapError> {
        let result = self.try_add_page(hooks, config);
        self.record(result)
    }

    fn try_add_page(&mut self, hooks: H, config: PageConfig) -> Result<(), HeapError> {
        ensure!(self.is_initialized(), NotInitializedSnafu);
        ensure!(
            !self.pages.is_full(),
            PageTableFullSnafu {
                capacity: MAX_PAGES
            }
        );
        let Some(size) = config
            .size
            .checked_next_multiple_of(ARENA_ALIGN)
            .filter(|size| *size > 0)
        else {
            return PageSizeSnafu {
                requested: config.size,
                minimum: ARENA_ALIGN,
            }
            .fail();
        };
        ensure!(
            size <= MAX_PAGE_SIZE,
            PageTooLargeSnafu {
                requested: size,
                maximum: MAX_PAGE_SIZE,
            }
        );
        let remaining = self.arena.end - self.cursor;
        ensure!(
            size <= remaining,
            OutOfArenaSnafu {
                requested: size,
                remaining,
            }
        );

        let range = self.cursor..self.cursor + size;
        let index = self.pages.len();
        let kind = match (config.page_type, config.page_type.chunk_size()) {
            (_, Some(chunk_size)) => {
                ensure!(
                    size >= chunk_size,
                    PageSizeSnafu {
                        requested: size,
                        minimum: chunk_size,
                    }
                );
                log::debug!(
                    "page {index}: {} {:#x}..{:#x}, {} chunks",
                    config.page_type,
                    range.start,
                    range.end,
                    size / chunk_size
                );
                PageKind::SmallFix(SmallFixPage::new(range, chunk_size))
            }
            (PageType::Big, None) => {
                let max_objects = if config.max_objects == 0 {
                    (size / BIG_PAGE_BYTES_PER_OBJECT).max(MIN_BIG_PAGE_OBJECTS)
                } else {
                    config.max_objects
                };
                let map_size = max_objects
                    .checked_mul(MAP_NODE_SIZE)
                    .and_then(|map_size| map_size.checked_next_multiple_of(ARENA_ALIGN))
                    .unwrap_or(usize::MAX);
                ensure!(
                    BigPage::min_page_size(map_size).is_some_and(|minimum| size >= minimum),
                    MapPageTooSmallSnafu { size, map_size }
                );
                log::debug!(
                    "page {index}: big {:#x}..{:#x}, map of {max_objects} entries ({map_size} bytes)",
                    range.start,
                    range.end
                );
                let reporter = Reporter::new(&hooks, self.config.corruption_policy, index);
                PageKind::Big(BigPage::new(range, map_size, &reporter))
            }
            (_, None) => {
                let (min_block_size, max_block_size) =
                    power_two_block_range(config.min_block_size, config.max_block_size)?;
                ensure!(
                    size >= min_block_size,
                    PageSizeSnafu {
                        requested: size,
                        minimum: min_block_size,
                    }
                );
                log::debug!(
                    "page {index}: power-two {:#x}..{:#x}, blocks {min_block_size}..={max_block_size}",
                    range.start,
                    range.end
                );
                PageKind::PowerTwo(PowerTwoPage::new(
                    range,
                    min_block_size,
                    max_block_size,
                    config.max_objects,
                ))
            }
        };

        let policy = self.config.corruption_policy;
        self.pages
            .push(Page::new(config.page_type, index, policy, hooks, kind));
        self.cursor += size;
        Ok(())
    }

    /// Fixed class holding a block of `size` bytes, or [`PageType::Big`].
    #[must_use]
    pub fn get_ideal_page(size: usize) -> PageType {
        PageType::ideal_for(size)
    }

    /// Picks the page serving a block of `size` bytes.
    ///
    /// The page of fixed class `ideal` wins; otherwise a big page unless
    /// `no_big`; otherwise the smallest fixed class holding `size`; otherwise
    /// a power-two page.
    #[must_use]
    pub fn select_page(&self, ideal: PageType, size: usize, no_big: bool) -> Option<usize> {
        let by_type =
            |page_type| self.pages.iter().position(|page| page.page_type() == page_type);

        if ideal.chunk_size().is_some()
            && let Some(index) = by_type(ideal)
        {
            return Some(index);
        }
        if !no_big && let Some(index) = by_type(PageType::Big) {
            return Some(index);
        }
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(index, page)| {
                let chunk_size = page.page_type().chunk_size()?;
                (chunk_size >= size).then_some((chunk_size, index))
            })
            .min()
            .map(|(_, index)| index)
            .or_else(|| by_type(PageType::PowerTwo))
    }

    /// Page class and block size used to serve a payload of `size` bytes.
    fn classify(&self, size: usize) -> Option<(PageType, usize)> {
        let total = size.checked_add(BLOCK_OVERHEAD).and_then(align_word)?;
        let has_big = self
            .pages
            .iter()
            .any(|page| page.page_type() == PageType::Big);
        if has_big {
            return Some((PageType::ideal_for(total), total));
        }
        let total = total.checked_next_power_of_two()?;
        Some((PageType::ideal_for(total), total))
    }

    /// Allocates `size` bytes.
    ///
    /// Returns `None` for a zero size, when no page matches or when the
    /// selected page is exhausted; [`last_error`](Self::last_error) tells
    /// which.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.finish(self.try_malloc(size))
    }

    fn try_malloc(&self, size: usize) -> Result<NonNull<u8>, ErrorCode> {
        if size == 0 {
            return Err(ErrorCode::BlockSizeNotAllowed);
        }
        if self.pages.is_empty() {
            return Err(ErrorCode::NoPages);
        }
        let (ideal, request) = self.classify(size).ok_or(ErrorCode::OutOfMemory)?;
        let index = self
            .select_page(ideal, request, false)
            .ok_or(ErrorCode::NoPage)?;
        let block = self.pages[index].allocate(request)?;
        Ok(block.payload())
    }

    /// Maps a payload pointer to its page and header address.
    ///
    /// Whether a live block sits there is up to the page to tell.
    fn locate(&self, ptr: NonNull<u8>) -> Result<(&Page<H>, usize), ErrorCode> {
        let addr = ptr.as_ptr().addr();
        if !self.arena.contains(&addr) {
            return Err(ErrorCode::NoPage);
        }
        if !addr.is_multiple_of(WORD_SIZE) {
            return Err(ErrorCode::InvalidBlock);
        }
        let header = addr.checked_sub(HEADER_SIZE).ok_or(ErrorCode::NoPage)?;
        let page = self
            .pages
            .iter()
            .find(|page| page.contains(header))
            .ok_or(ErrorCode::NoPage)?;
        Ok((page, header))
    }

    /// Releases a block returned by this heap.
    ///
    /// Null, foreign, invalid and already freed pointers are ignored; the
    /// reason is kept in [`last_error`](Self::last_error).
    ///
    /// # Safety
    ///
    /// If `ptr` points into the arena it must not be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let result = self
            .locate(ptr)
            .and_then(|(page, header)| page.free(header));
        if let Err(code) = result {
            log::warn!("ignoring free of {ptr:p}: {code}");
        }
        self.finish(result);
    }

    /// Allocates a zeroed array of `count` elements of `size` bytes.
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let Some(total) = count.checked_mul(size) else {
            self.set_last_error(ErrorCode::OutOfMemory);
            return None;
        };
        let ptr = self.malloc(total)?;
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Some(ptr)
    }

    /// Resizes the block at `ptr` to `size` bytes.
    ///
    /// A null `ptr` allocates; a zero `size` frees and returns `None`. If
    /// the block already has the size a fresh allocation would get, `ptr` is
    /// returned unchanged. Otherwise the contents move to a new block. When
    /// that allocation fails the original block stays valid and `None` is
    /// returned. When the old block cannot be released afterwards, the new
    /// pointer is still returned and [`last_error`](Self::last_error) tells
    /// why the old block is still allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this heap. On
    /// success it must not be used afterwards unless it is returned again.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.malloc(size);
        };
        if size == 0 {
            unsafe { self.free(ptr) };
            return None;
        }
        let found = self
            .locate(old)
            .and_then(|(page, header)| Ok((page, header, page.block_size(header)?)));
        let (page, header, block_size) = match found {
            Ok(found) => found,
            Err(code) => {
                log::warn!("ignoring realloc of {old:p}: {code}");
                self.set_last_error(code);
                return None;
            }
        };
        if self
            .classify(size)
            .is_some_and(|(_, request)| request == block_size)
        {
            self.set_last_error(ErrorCode::Ok);
            return Some(old);
        }

        let new = self.malloc(size)?;
        let len = block_size.saturating_sub(BLOCK_OVERHEAD).min(size);
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), len) };
        if let Err(code) = page.free(header) {
            log::warn!("realloc moved {old:p} to {new:p} but kept the old block: {code}");
            self.set_last_error(code);
        }
        Some(new)
    }

    /// Checks that `len` bytes at `ptr` fit the payload of a live block, if
    /// `ptr` lies inside the arena.
    fn check_span(&self, ptr: *const u8, len: usize) -> Result<(), ErrorCode> {
        if !self.arena.contains(&ptr.addr()) {
            return Ok(());
        }
        let ptr = NonNull::new(ptr.cast_mut()).ok_or(ErrorCode::InvalidBlock)?;
        if len > self.payload_size(ptr)? {
            return Err(ErrorCode::BlockSizeNotAllowed);
        }
        Ok(())
    }

    fn payload_size(&self, ptr: NonNull<u8>) -> Result<usize, ErrorCode> {
        let (page, header) = self.locate(ptr)?;
        let block_size = page.block_size(header)?;
        Ok(block_size.saturating_sub(BLOCK_OVERHEAD))
    }

    /// Copies `len` bytes from `src` to `dst`, which may overlap.
    ///
    /// Pointers inside the arena must be payload pointers of live blocks
    /// large enough for `len` bytes; pointers outside are not checked.
    /// Returns `dst`, or `None` if a check fails.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `len` bytes.
    pub unsafe fn memcpy(
        &self,
        dst: *mut u8,
        src: *const u8,
        len: usize,
    ) -> Option<NonNull<u8>> {
        let dst_ptr = NonNull::new(dst)?;
        if src.is_null() {
            return None;
        }
        let checked = self
            .check_span(dst, len)
            .and_then(|()| self.check_span(src, len));
        if let Err(code) = checked {
            log::warn!("rejected copy of {len} bytes from {src:p} to {dst:p}: {code}");
        }
        self.finish(checked)?;
        unsafe { ptr::copy(src, dst, len) };
        Some(dst_ptr)
    }

    /// Fills `len` bytes at `dst` with `value`, checked like
    /// [`memcpy`](Self::memcpy).
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` bytes.
    pub unsafe fn memset(&self, dst: *mut u8, value: u8, len: usize) -> Option<NonNull<u8>> {
        let dst_ptr = NonNull::new(dst)?;
        let checked = self.check_span(dst, len);
        if let Err(code) = checked {
            log::warn!("rejected fill of {len} bytes at {dst:p}: {code}");
        }
        self.finish(checked)?;
        unsafe { dst.write_bytes(value, len) };
        Some(dst_ptr)
    }

    /// Payload capacity of the live block at `ptr`.
    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let ptr = NonNull::new(ptr.cast_mut())?;
        self.payload_size(ptr).ok()
    }

    /// Returns `true` if `ptr` lies inside the arena.
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.arena.contains(&ptr.addr())
    }

    #[must_use]
    pub fn arena(&self) -> Range<usize> {
        self.arena.clone()
    }

    /// Bytes of the arena not yet assigned to a page.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.arena.end - self.cursor
    }

    #[must_use]
    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Outcome of the most recent operation on any thread.
    #[must_use]
    pub fn last_error(&self) -> ErrorCode {
        ErrorCode::from_u32(self.last_error.load(Ordering::Relaxed)).unwrap_or_default()
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Accounting of page `index`, taken inside the page's critical section.
    ///
    /// Returns `None` for an unknown index or a page held by an overlapping
    /// call.
    #[must_use]
    pub fn page_stats(&self, index: usize) -> Option<PageStats> {
        self.pages.get(index)?.stats().ok()
    }

    /// Walks every page and cross-checks its blocks with its free structure.
    ///
    /// The first broken page is reported through its hooks.
    pub fn check_integrity(&self) -> Result<(), ErrorCode> {
        self.pages.iter().try_for_each(Page::check)
    }
}

/// Rounds the block range of a power-two page to powers of two and applies
/// the floors.
fn power_two_block_range(
    min_block_size: usize,
    max_block_size: usize,
) -> Result<(usize, usize), HeapError> {
    let min = min_block_size
        .checked_next_power_of_two()
        .filter(|_| min_block_size != 0)
        .map(|min| min.max(MIN_POWER_TWO_BLOCK));
    let max = max_block_size
        .checked_next_power_of_two()
        .filter(|_| max_block_size != 0)
        .map(|max| max.max(MIN_POWER_TWO_MAX_BLOCK));
    match (min, max) {
        (Some(min), Some(max)) if min <= max => Ok((min, max)),
        _ => BlockRangeSnafu {
            min_block_size,
            max_block_size,
        }
        .fail(),
    }
}
