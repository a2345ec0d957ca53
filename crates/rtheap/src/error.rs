//! Error codes and initialization errors.
//!
//! Runtime failures of the heap never unwind: allocation failures surface as
//! `None` plus a recorded [`ErrorCode`], and corruption is reported through
//! [`PageHooks::on_error`](crate::PageHooks::on_error). Only the
//! set-up operations ([`Heap::init`](crate::Heap::init) and
//! [`Heap::add_page`](crate::Heap::add_page)) return a rich
//! [`HeapError`].

use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

/// Numeric error codes shared with the C interface.
///
/// The discriminants are part of the external ABI and must not be reordered.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    Ok = 0,
    ErrorInit = 1,
    ErrorInitPageSize = 2,
    ErrorInitOutOfHeap = 3,
    OutOfMemory = 4,
    NoPages = 5,
    NoPage = 6,
    /// The page table is full, or the selected page is held by an
    /// overlapping call that its hooks did not serialize.
    NoFreePage = 7,
    InvalidBlock = 8,
    InvalidBlockDistance = 9,
    InvalidNumberOfFreeBlocks = 10,
    BlockSizeNotAllowed = 11,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        let code = match value {
            0 => Self::Ok,
            1 => Self::ErrorInit,
            2 => Self::ErrorInitPageSize,
            3 => Self::ErrorInitOutOfHeap,
            4 => Self::OutOfMemory,
            5 => Self::NoPages,
            6 => Self::NoPage,
            7 => Self::NoFreePage,
            8 => Self::InvalidBlock,
            9 => Self::InvalidBlockDistance,
            10 => Self::InvalidNumberOfFreeBlocks,
            11 => Self::BlockSizeNotAllowed,
            _ => return None,
        };
        Some(code)
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.as_u32()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Ok => "ok",
            Self::ErrorInit => "heap initialization failed",
            Self::ErrorInitPageSize => "invalid page size",
            Self::ErrorInitOutOfHeap => "page does not fit into the remaining arena",
            Self::OutOfMemory => "out of memory",
            Self::NoPages => "heap has no pages",
            Self::NoPage => "no page matches the request",
            Self::NoFreePage => "no free page",
            Self::InvalidBlock => "invalid block",
            Self::InvalidBlockDistance => "invalid block distance",
            Self::InvalidNumberOfFreeBlocks => "free block count mismatch",
            Self::BlockSizeNotAllowed => "block size not allowed",
        };
        f.write_str(msg)
    }
}

/// Source location captured when a [`HeapError`] is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors returned while setting up the arena and its pages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapError {
    #[snafu(display("arena of {size} bytes is empty after alignment"))]
    ArenaTooSmall {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap is not initialized"))]
    NotInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page of {requested} bytes is smaller than the minimum of {minimum} bytes"))]
    PageSize {
        requested: usize,
        minimum: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page of {requested} bytes exceeds the maximum of {maximum} bytes"))]
    PageTooLarge {
        requested: usize,
        maximum: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page of {requested} bytes exceeds the {remaining} bytes left in the arena"))]
    OutOfArena {
        requested: usize,
        remaining: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page table is full ({capacity} pages)"))]
    PageTableFull {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page of {size} bytes cannot hold a free map of {map_size} bytes"))]
    MapPageTooSmall {
        size: usize,
        map_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid block size range {min_block_size}..={max_block_size}"))]
    BlockRange {
        min_block_size: usize,
        max_block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl HeapError {
    /// Returns the numeric code reported to the C interface for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ArenaTooSmall { .. } | Self::NotInitialized { .. } => ErrorCode::ErrorInit,
            Self::PageSize { .. }
            | Self::PageTooLarge { .. }
            | Self::MapPageTooSmall { .. }
            | Self::BlockRange { .. } => ErrorCode::ErrorInitPageSize,
            Self::OutOfArena { .. } => ErrorCode::ErrorInitOutOfHeap,
            Self::PageTableFull { .. } => ErrorCode::NoFreePage,
        }
    }

    /// Returns where the error was raised.
    #[must_use]
    pub const fn location(&self) -> Location {
        match self {
            Self::ArenaTooSmall { location, .. }
            | Self::NotInitialized { location, .. }
            | Self::PageSize { location, .. }
            | Self::PageTooLarge { location, .. }
            | Self::OutOfArena { location, .. }
            | Self::PageTableFull { location, .. }
            | Self::MapPageTooSmall { location, .. }
            | Self::BlockRange { location, .. } => *location,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Ok.as_u32(), 0);
        assert_eq!(ErrorCode::ErrorInit.as_u32(), 1);
        assert_eq!(ErrorCode::OutOfMemory.as_u32(), 4);
        assert_eq!(ErrorCode::InvalidBlock.as_u32(), 8);
        assert_eq!(u32::from(ErrorCode::BlockSizeNotAllowed), 11);
    }

    #[test]
    fn test_error_code_from_u32() {
        for value in 0..12 {
            assert_eq!(ErrorCode::from_u32(value).unwrap().as_u32(), value);
        }
        assert_eq!(ErrorCode::from_u32(12), None);
    }

    #[test]
    fn test_heap_error_code() {
        let err = ArenaTooSmallSnafu { size: 3_usize }.build();
        assert_eq!(err.code(), ErrorCode::ErrorInit);

        let err = OutOfArenaSnafu {
            requested: 128_usize,
            remaining: 64_usize,
        }
        .build();
        assert_eq!(err.code(), ErrorCode::ErrorInitOutOfHeap);

        let err = PageTableFullSnafu { capacity: 16_usize }.build();
        assert_eq!(err.code(), ErrorCode::NoFreePage);
    }

    #[test]
    fn test_location_points_here() {
        let err = NotInitializedSnafu.build();
        let location = err.location();
        let text = std::format!("{location}");
        assert!(text.contains("error.rs"));
    }
}
