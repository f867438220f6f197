//! Page 0: static tree metadata plus two alternating checkpoint records.
//!
//! The static region is checksummed together with the common header and is
//! written once, when the file is created. Checkpoint records live in two
//! fixed slots at sector-aligned offsets; every checkpoint writes the slot
//! that is not active, so the previous record stays intact until the new one
//! is durable.

use core::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::bytes::{get_u16, get_u32, get_u64, put_u32, put_u64};
use crate::storage::btree::pointer::GenPointer;
use crate::storage::layout::Layout;
use crate::types::{
    checksum::record_crc32,
    page::{self, header, PageHeader, PageKind, PAGE_FORMAT_VERSION, PAGE_MAGIC},
    page_crc32, PageId, Result, TreeError,
};

/// Page holding metadata and checkpoint records.
pub const META_PAGE: PageId = PageId(0);

const LAYOUT_ID: Range<usize> = 32..40;
const LAYOUT_MAJOR: Range<usize> = 40..44;
const LAYOUT_MINOR: Range<usize> = 44..48;
const KEY_SIZE: Range<usize> = 48..52;
const VALUE_SIZE: Range<usize> = 52..56;
const STATIC_END: usize = 64;

/// Byte offsets of checkpoint slots A and B.
pub(crate) const RECORD_SLOTS: [usize; 2] = [512, 768];
const RECORD_LEN: usize = 64;
const RECORD_MAGIC: [u8; 4] = *b"CKPT";

mod record {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const STABLE: usize = 4;
    pub const UNSTABLE: usize = 12;
    pub const ROOT_PAGE: usize = 20;
    pub const ROOT_GEN: usize = 28;
    pub const FREE_HEAD: usize = 36;
    pub const NEXT_PAGE: usize = 44;
    pub const CLEAN: usize = 52;
    pub const CRC32: usize = 60;
}

/// Static metadata written when the tree file is created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TreeMeta {
    pub page_size: u32,
    pub salt: u64,
    pub layout_id: u64,
    pub major: u32,
    pub minor: u32,
    /// Zero when keys are variable-length.
    pub key_size: u32,
    /// Zero when values are variable-length.
    pub value_size: u32,
}

impl TreeMeta {
    pub(crate) fn for_layout<L: Layout>(layout: &L, page_size: u32) -> Self {
        Self {
            page_size,
            salt: OsRng.next_u64(),
            layout_id: layout.identifier(),
            major: layout.major_version(),
            minor: layout.minor_version(),
            key_size: layout.key_size().unwrap_or(0) as u32,
            value_size: layout.value_size().unwrap_or(0) as u32,
        }
    }
}

/// Durable description of one checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CheckpointRecord {
    pub stable: u64,
    pub unstable: u64,
    pub root: GenPointer,
    pub free_head: PageId,
    pub next_page: u64,
    pub clean: bool,
}

impl CheckpointRecord {
    fn order(&self) -> (u64, u64) {
        (self.stable, self.unstable)
    }
}

/// Writes the header and static region of page 0. Checkpoint slots are left
/// untouched.
pub(crate) fn write_meta(buf: &mut [u8], meta: &TreeMeta) -> Result<()> {
    buf[..STATIC_END].fill(0);
    PageHeader::new(META_PAGE, PageKind::Meta, meta.page_size, meta.salt)?.encode(buf)?;
    put_u64(buf, LAYOUT_ID.start, meta.layout_id);
    put_u32(buf, LAYOUT_MAJOR.start, meta.major);
    put_u32(buf, LAYOUT_MINOR.start, meta.minor);
    put_u32(buf, KEY_SIZE.start, meta.key_size);
    put_u32(buf, VALUE_SIZE.start, meta.value_size);
    let crc = static_crc32(buf, meta.salt);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

fn static_crc32(buf: &[u8], salt: u64) -> u32 {
    let mut scratch = [0u8; STATIC_END];
    scratch.copy_from_slice(&buf[..STATIC_END]);
    scratch[header::CRC32].fill(0);
    page_crc32(META_PAGE.0, salt, &scratch)
}

fn mismatch(field: &str, stored: impl std::fmt::Display, expected: impl std::fmt::Display) -> TreeError {
    TreeError::FormatMismatch(format!(
        "{field} mismatch: stored {stored}, expected {expected}"
    ))
}

/// Reads page 0 and checks that it was written by this format, with this
/// page size and by a compatible layout.
///
/// Fields are compared in a fixed order, format version first, before the
/// static checksum is verified; nothing else in the file is looked at.
pub(crate) fn read_meta<L: Layout>(buf: &[u8], layout: &L, page_size: u32) -> Result<TreeMeta> {
    if buf.len() < STATIC_END {
        return Err(TreeError::Corruption("metadata page truncated"));
    }
    if buf[header::MAGIC] != PAGE_MAGIC {
        return Err(TreeError::Corruption("metadata page magic mismatch"));
    }
    let version = get_u16(buf, header::FORMAT_VERSION.start);
    if version != PAGE_FORMAT_VERSION {
        return Err(mismatch("format version", version, PAGE_FORMAT_VERSION));
    }
    let stored_page_size = get_u32(buf, header::PAGE_SIZE.start);
    if stored_page_size != page_size {
        return Err(mismatch("page size", stored_page_size, page_size));
    }
    let layout_id = get_u64(buf, LAYOUT_ID.start);
    if layout_id != layout.identifier() {
        return Err(mismatch(
            "layout identifier",
            format_args!("{layout_id:#018x}"),
            format_args!("{:#018x}", layout.identifier()),
        ));
    }
    let major = get_u32(buf, LAYOUT_MAJOR.start);
    let minor = get_u32(buf, LAYOUT_MINOR.start);
    if (major, minor) != (layout.major_version(), layout.minor_version()) {
        return Err(mismatch(
            "layout version",
            format_args!("{major}.{minor}"),
            format_args!("{}.{}", layout.major_version(), layout.minor_version()),
        ));
    }
    let key_size = get_u32(buf, KEY_SIZE.start);
    let expected_key = layout.key_size().unwrap_or(0) as u32;
    if key_size != expected_key {
        return Err(mismatch("key size", key_size, expected_key));
    }
    let value_size = get_u32(buf, VALUE_SIZE.start);
    let expected_value = layout.value_size().unwrap_or(0) as u32;
    if value_size != expected_value {
        return Err(mismatch("value size", value_size, expected_value));
    }

    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Meta || header.page_no != META_PAGE {
        return Err(TreeError::Corruption("page 0 is not a metadata page"));
    }
    if static_crc32(buf, header.salt) != header.crc32 {
        return Err(TreeError::Corruption("metadata checksum mismatch"));
    }
    Ok(TreeMeta {
        page_size,
        salt: header.salt,
        layout_id,
        major,
        minor,
        key_size,
        value_size,
    })
}

/// Encodes `rec` into checkpoint slot `slot` of page 0.
pub(crate) fn write_record(buf: &mut [u8], slot: usize, rec: &CheckpointRecord) {
    let at = RECORD_SLOTS[slot];
    let dst = &mut buf[at..at + RECORD_LEN];
    dst.fill(0);
    dst[record::MAGIC].copy_from_slice(&RECORD_MAGIC);
    put_u64(dst, record::STABLE, rec.stable);
    put_u64(dst, record::UNSTABLE, rec.unstable);
    put_u64(dst, record::ROOT_PAGE, rec.root.page.0);
    put_u64(dst, record::ROOT_GEN, rec.root.generation);
    put_u64(dst, record::FREE_HEAD, rec.free_head.0);
    put_u64(dst, record::NEXT_PAGE, rec.next_page);
    dst[record::CLEAN] = u8::from(rec.clean);
    let crc = record_crc32(&dst[..record::CRC32]);
    put_u32(dst, record::CRC32, crc);
}

/// Decodes checkpoint slot `slot`; `None` if it is empty or torn.
pub(crate) fn read_record(buf: &[u8], slot: usize) -> Option<CheckpointRecord> {
    let at = RECORD_SLOTS[slot];
    let src = &buf[at..at + RECORD_LEN];
    if src[record::MAGIC] != RECORD_MAGIC {
        return None;
    }
    if record_crc32(&src[..record::CRC32]) != get_u32(src, record::CRC32) {
        return None;
    }
    Some(CheckpointRecord {
        stable: get_u64(src, record::STABLE),
        unstable: get_u64(src, record::UNSTABLE),
        root: GenPointer::new(
            PageId(get_u64(src, record::ROOT_PAGE)),
            get_u64(src, record::ROOT_GEN),
        ),
        free_head: PageId(get_u64(src, record::FREE_HEAD)),
        next_page: get_u64(src, record::NEXT_PAGE),
        clean: src[record::CLEAN] != 0,
    })
}

/// Picks the valid slot with the highest `(stable, unstable)`.
pub(crate) fn active_record(buf: &[u8]) -> Result<(usize, CheckpointRecord)> {
    let candidates = [read_record(buf, 0), read_record(buf, 1)];
    candidates
        .iter()
        .enumerate()
        .filter_map(|(slot, rec)| rec.map(|rec| (slot, rec)))
        .max_by_key(|(_, rec)| rec.order())
        .ok_or(TreeError::Corruption("no valid checkpoint record"))
}

/// Smallest page that fits both checkpoint slots.
pub(crate) const fn min_meta_page_size() -> usize {
    RECORD_SLOTS[1] + RECORD_LEN
}

const _: () = assert!(min_meta_page_size() <= page::MIN_PAGE_SIZE as usize);
