#![forbid(unsafe_code)]
//! Shared identifiers, errors and the common on-disk page header.

use std::fmt;

/// Checksum helpers used by every page codec.
pub mod checksum;

pub use checksum::{page_crc32, page_crc32_parts};

/// Identifier of a page within the tree file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structural rule broken by a tree, as reported by the consistency checker
/// and by the bounded generation chase.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Invariant {
    /// Keys inside a node are not strictly ascending.
    KeyOrder,
    /// A key lies outside the range implied by its ancestors' separators.
    SeparatorBounds,
    /// A child pointer refers to an unreadable page or a page of another generation.
    ChildPointer,
    /// Nodes of one level disagree on their kind, or leaves sit at different depths.
    NodeKind,
    /// Left/right sibling links of a level do not form a doubly-linked chain.
    SiblingChain,
    /// A page is reachable twice, or is reachable and free at the same time.
    PageAliasing,
    /// A page is neither reachable, free nor part of the free-list chain.
    LeakedPage,
    /// A node generation is out of the allowed range for its position.
    GenerationOrder,
    /// A reader kept finding stale pages and gave up.
    GenerationChase,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Invariant::KeyOrder => "key order",
            Invariant::SeparatorBounds => "separator bounds",
            Invariant::ChildPointer => "child pointer",
            Invariant::NodeKind => "node kind",
            Invariant::SiblingChain => "sibling chain",
            Invariant::PageAliasing => "page aliasing",
            Invariant::LeakedPage => "leaked page",
            Invariant::GenerationOrder => "generation order",
            Invariant::GenerationChase => "generation chase",
        };
        f.write_str(name)
    }
}

/// Error type shared by every layer of the crate.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// Failure reported by the file system.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Bytes on disk that cannot be decoded.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Argument rejected before any state changed.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Persisted metadata disagrees with what the caller asked for.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
    /// A writer is already open on this tree.
    #[error("a writer is already open on this tree")]
    ConcurrentWriter,
    /// A structural rule does not hold.
    #[error("inconsistent tree at page {page}: {invariant}: {detail}")]
    InconsistentTree {
        /// Page where the violation was observed.
        page: PageId,
        /// Rule that was broken.
        invariant: Invariant,
        /// Human-readable description.
        detail: String,
    },
    /// Operation called in a state that does not allow it.
    #[error("usage: {0}")]
    Usage(&'static str),
    /// Configuration text that cannot be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TreeError {
    pub(crate) fn inconsistent(page: PageId, invariant: Invariant, detail: impl Into<String>) -> Self {
        TreeError::InconsistentTree {
            page,
            invariant,
            detail: detail.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

pub mod page {
    //! Common 32-byte header carried by every page of a tree file.

    use core::convert::TryFrom;

    use super::{PageId, Result, TreeError};
    use crate::primitives::bytes::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};

    /// Magic bytes at the start of every page.
    pub const PAGE_MAGIC: [u8; 4] = *b"GBPT";
    /// Version of the on-disk format written by this crate.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Page size used when nothing else is configured.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 1024;
    /// Largest supported page size; entry lengths and key counts are 16-bit.
    pub const MAX_PAGE_SIZE: u32 = 65536;
    /// Length of the common header.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        /// File magic, `GBPT`.
        pub const MAGIC: Range<usize> = 0..4;
        /// On-disk format version.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// [`super::PageKind`] tag.
        pub const PAGE_KIND: usize = 6;
        /// Unused; written as zero.
        pub const RESERVED: usize = 7;
        /// Page size the file was created with.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// Number of the page holding this header.
        pub const PAGE_NO: Range<usize> = 12..20;
        /// Per-file salt mixed into every page checksum.
        pub const SALT: Range<usize> = 20..28;
        /// Page checksum.
        pub const CRC32: Range<usize> = 28..32;
    }

    /// Role of a page inside the file.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Page 0: static tree metadata and checkpoint records.
        Meta = 1,
        /// Persisted free-list chain page.
        FreeList = 2,
        /// Tree leaf holding key/value pairs.
        TreeLeaf = 3,
        /// Tree internal node holding separators and child pointers.
        TreeInternal = 4,
    }

    impl PageKind {
        /// Returns the on-disk tag.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = TreeError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::FreeList),
                3 => Ok(PageKind::TreeLeaf),
                4 => Ok(PageKind::TreeInternal),
                _ => Err(TreeError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded common page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version stamped when the page was written.
        pub format_version: u16,
        /// Role of the page.
        pub kind: PageKind,
        /// Page size of the file.
        pub page_size: u32,
        /// Page number the page was written for.
        pub page_no: PageId,
        /// Per-file salt mixed into every checksum.
        pub salt: u64,
        /// Stored checksum.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Builds a header for the current format version.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(TreeError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                salt,
                crc32: 0,
            })
        }

        /// Returns the header with the given checksum.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(TreeError::Invalid("page header buffer too small"));
            }
            dst[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            put_u16(dst, header::FORMAT_VERSION.start, self.format_version);
            dst[header::PAGE_KIND] = self.kind.as_u8();
            dst[header::RESERVED] = 0;
            put_u32(dst, header::PAGE_SIZE.start, self.page_size);
            put_u64(dst, header::PAGE_NO.start, self.page_no.0);
            put_u64(dst, header::SALT.start, self.salt);
            put_u32(dst, header::CRC32.start, self.crc32);
            Ok(())
        }

        /// Parses and validates a header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(TreeError::Corruption("page header truncated"));
            }
            if src[header::MAGIC] != PAGE_MAGIC {
                return Err(TreeError::Corruption("invalid page magic"));
            }
            let format_version = get_u16(src, header::FORMAT_VERSION.start);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(TreeError::Corruption("unsupported page format version"));
            }
            if src[header::RESERVED] != 0 {
                return Err(TreeError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(src[header::PAGE_KIND])?;
            let page_size = get_u32(src, header::PAGE_SIZE.start);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(TreeError::Corruption("page size smaller than header"));
            }
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no: PageId(get_u64(src, header::PAGE_NO.start)),
                salt: get_u64(src, header::SALT.start),
                crc32: get_u32(src, header::CRC32.start),
            })
        }
    }

    /// Zeroes the checksum field of an encoded header.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(TreeError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Reads the page kind tag without validating the rest of the header.
    pub fn raw_kind(buf: &[u8]) -> Option<PageKind> {
        buf.get(header::PAGE_KIND)
            .and_then(|tag| PageKind::try_from(*tag).ok())
    }
}
