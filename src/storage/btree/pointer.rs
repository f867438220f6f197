//! Generation-tagged page pointers.
//!
//! Child pointers are a plain `(page, generation)` pair: a parent is always
//! copied before one of its child pointers changes. Sibling pointers are
//! updated in place on pages that may belong to the stable checkpoint, so
//! they are stored as a pair of checksummed slots. A slot carries the
//! generation it was written in, which lets readers ignore slots written by
//! a generation that never reached a checkpoint.

use crate::primitives::bytes::{get_u32, get_u64, put_u32, put_u64};
use crate::types::{checksum::record_crc32, PageId};

/// Encoded length of a [`GenPointer`].
pub const POINTER_LEN: usize = 16;
/// Encoded length of one slot of a pointer pair.
pub const SLOT_LEN: usize = 32;
/// Encoded length of a pointer pair.
pub const PAIR_LEN: usize = 2 * SLOT_LEN;

mod slot {
    pub const WRITTEN: usize = 0;
    pub const TARGET_PAGE: usize = 8;
    pub const TARGET_GEN: usize = 16;
    pub const CRC32: usize = 24;
    pub const CHECKED_LEN: usize = 24;
}

/// Page id plus the generation the target page is expected to carry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct GenPointer {
    /// Target page.
    pub page: PageId,
    /// Generation the target was written in.
    pub generation: u64,
}

impl GenPointer {
    /// Pointer to nothing; page 0 never holds a tree node.
    pub const NULL: GenPointer = GenPointer {
        page: PageId(0),
        generation: 0,
    };

    /// Builds a pointer.
    pub const fn new(page: PageId, generation: u64) -> Self {
        Self { page, generation }
    }

    /// Returns whether this is [`GenPointer::NULL`].
    pub fn is_null(&self) -> bool {
        self.page.0 == 0
    }

    pub(crate) fn encode(&self, dst: &mut [u8]) {
        put_u64(dst, 0, self.page.0);
        put_u64(dst, 8, self.generation);
    }

    pub(crate) fn decode(src: &[u8]) -> Self {
        Self {
            page: PageId(get_u64(src, 0)),
            generation: get_u64(src, 8),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PointerSlot {
    pub written: u64,
    pub target: GenPointer,
}

fn decode_slot(src: &[u8]) -> Option<PointerSlot> {
    let stored = get_u32(src, slot::CRC32);
    if record_crc32(&src[..slot::CHECKED_LEN]) != stored {
        return None;
    }
    Some(PointerSlot {
        written: get_u64(src, slot::WRITTEN),
        target: GenPointer::new(
            PageId(get_u64(src, slot::TARGET_PAGE)),
            get_u64(src, slot::TARGET_GEN),
        ),
    })
}

fn encode_slot(dst: &mut [u8], written: u64, target: GenPointer) {
    dst[..SLOT_LEN].fill(0);
    put_u64(dst, slot::WRITTEN, written);
    put_u64(dst, slot::TARGET_PAGE, target.page.0);
    put_u64(dst, slot::TARGET_GEN, target.generation);
    let crc = record_crc32(&dst[..slot::CHECKED_LEN]);
    put_u32(dst, slot::CRC32, crc);
}

fn slots(pair: &[u8]) -> [Option<PointerSlot>; 2] {
    [
        decode_slot(&pair[..SLOT_LEN]),
        decode_slot(&pair[SLOT_LEN..PAIR_LEN]),
    ]
}

fn visible(slot: &PointerSlot, stable: u64, unstable: u64) -> bool {
    slot.written <= stable || slot.written == unstable
}

/// Resolves a pointer pair for a reader at `(stable, unstable)`.
///
/// Returns `None` when no slot is visible.
pub(crate) fn read_pair(pair: &[u8], stable: u64, unstable: u64) -> Option<GenPointer> {
    slots(pair)
        .into_iter()
        .flatten()
        .filter(|slot| visible(slot, stable, unstable))
        .max_by_key(|slot| slot.written)
        .map(|slot| slot.target)
}

/// Writes `target` into a pair in generation `unstable`.
///
/// A slot already written in `unstable` is overwritten. Otherwise the newest
/// slot visible at `stable` is kept and the other slot is replaced.
pub(crate) fn write_pair(pair: &mut [u8], target: GenPointer, stable: u64, unstable: u64) {
    let decoded = slots(pair);
    let current = decoded
        .iter()
        .position(|slot| matches!(slot, Some(s) if s.written == unstable));
    let victim = current.unwrap_or_else(|| {
        let keep = |slot: &Option<PointerSlot>| match slot {
            Some(s) if s.written <= stable => Some(s.written),
            _ => None,
        };
        match (keep(&decoded[0]), keep(&decoded[1])) {
            (Some(a), Some(b)) => usize::from(a >= b),
            (Some(_), None) => 1,
            _ => 0,
        }
    });
    let at = victim * SLOT_LEN;
    encode_slot(&mut pair[at..at + SLOT_LEN], unstable, target);
}

/// Initialises a pair for a page freshly written in `generation`.
pub(crate) fn init_pair(pair: &mut [u8], target: GenPointer, generation: u64) {
    encode_slot(&mut pair[..SLOT_LEN], generation, target);
    pair[SLOT_LEN..PAIR_LEN].fill(0);
}

/// Zeroes slots written by a generation that never reached a checkpoint.
///
/// Returns how many slots were cleared.
pub(crate) fn clear_crashed(pair: &mut [u8], stable: u64, unstable: u64) -> usize {
    let decoded = slots(pair);
    let mut cleared = 0;
    for (idx, slot) in decoded.iter().enumerate() {
        if let Some(slot) = slot {
            if slot.written > stable && slot.written < unstable {
                let at = idx * SLOT_LEN;
                pair[at..at + SLOT_LEN].fill(0);
                cleared += 1;
            }
        }
    }
    cleared
}
