//! Tree node page format.
//!
//! ```text
//! 0..32     common page header (kind TreeLeaf / TreeInternal)
//! 32..34    key count
//! 40..48    node generation
//! 48..112   right sibling pointer pair
//! 112..176  left sibling pointer pair
//! 176..     entries
//! ```
//!
//! Leaves store `key value` pairs, internal nodes store `child0` followed by
//! `key child` pairs. Keys and values are raw when the layout fixes their
//! size and carry a `u16` length prefix otherwise. The page checksum skips
//! the sibling pointer pairs, which are rewritten in place and protected by
//! their own slot checksums.

use std::cmp::Ordering;
use std::ops::Range;

use crate::primitives::bytes::{get_u16, get_u64, put_u16, put_u64};
use crate::storage::btree::pointer::{self, GenPointer, PAIR_LEN, POINTER_LEN};
use crate::storage::layout::Layout;
use crate::types::{
    page::{header, raw_kind, PageHeader, PageKind},
    page_crc32_parts, PageId, Result, TreeError,
};

/// Bytes reserved for the common header plus the node header.
pub const NODE_HEADER_LEN: usize = 176;

const KEY_COUNT: usize = 32;
const GENERATION: usize = 40;
/// Right sibling pointer pair.
pub(crate) const RIGHT_SIBLING: Range<usize> = 48..48 + PAIR_LEN;
/// Left sibling pointer pair.
pub(crate) const LEFT_SIBLING: Range<usize> = 112..112 + PAIR_LEN;
const LEN_PREFIX: usize = 2;

/// Leaf or internal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Holds key/value pairs.
    Leaf,
    /// Holds separators and child pointers.
    Internal,
}

impl NodeKind {
    fn page_kind(self) -> PageKind {
        match self {
            NodeKind::Leaf => PageKind::TreeLeaf,
            NodeKind::Internal => PageKind::TreeInternal,
        }
    }
}

/// Which sibling pointer pair of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    pub(crate) fn range(self) -> Range<usize> {
        match self {
            Side::Left => LEFT_SIBLING,
            Side::Right => RIGHT_SIBLING,
        }
    }
}

/// Entry sizes fixed by the layout, `None` meaning length-prefixed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct EntryFormat {
    pub key_size: Option<usize>,
    pub value_size: Option<usize>,
}

impl EntryFormat {
    pub(crate) fn of<L: Layout>(layout: &L) -> Self {
        Self {
            key_size: layout.key_size(),
            value_size: layout.value_size(),
        }
    }

    pub(crate) fn key_len(&self, key: &[u8]) -> usize {
        encoded_len(self.key_size, key)
    }

    pub(crate) fn value_len(&self, value: &[u8]) -> usize {
        encoded_len(self.value_size, value)
    }
}

fn encoded_len(fixed: Option<usize>, bytes: &[u8]) -> usize {
    match fixed {
        Some(_) => bytes.len(),
        None => LEN_PREFIX + bytes.len(),
    }
}

/// Bytes available for entries on one page.
pub(crate) fn capacity(page_size: usize) -> usize {
    page_size - NODE_HEADER_LEN
}

/// Largest encoded leaf entry accepted by the writer.
pub(crate) fn max_entry_len(page_size: usize) -> usize {
    capacity(page_size) / 4 - POINTER_LEN
}

/// Reads the generation field of a node page without decoding it.
pub(crate) fn raw_generation(buf: &[u8]) -> u64 {
    get_u64(buf, GENERATION)
}

/// Returns the node kind if `buf` is tagged as a tree node page.
pub(crate) fn raw_node_kind(buf: &[u8]) -> Option<NodeKind> {
    match raw_kind(buf) {
        Some(PageKind::TreeLeaf) => Some(NodeKind::Leaf),
        Some(PageKind::TreeInternal) => Some(NodeKind::Internal),
        _ => None,
    }
}

fn node_crc32(page_no: u64, salt: u64, buf: &[u8]) -> u32 {
    page_crc32_parts(
        page_no,
        salt,
        &[
            &buf[..header::CRC32.start],
            &buf[header::CRC32.end..RIGHT_SIBLING.start],
            &buf[NODE_HEADER_LEN..],
        ],
    )
}

/// Decoded, owned copy of a node.
///
/// `page` is `None` for nodes that have not been assigned a page yet.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub page: Option<PageId>,
    pub generation: u64,
    pub kind: NodeKind,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub children: Vec<GenPointer>,
    pub left: GenPointer,
    pub right: GenPointer,
    /// False when a sibling pair had no slot visible to the decoding reader.
    pub links_visible: bool,
}

impl Node {
    pub(crate) fn new_leaf() -> Self {
        Self {
            page: None,
            generation: 0,
            kind: NodeKind::Leaf,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            left: GenPointer::NULL,
            right: GenPointer::NULL,
            links_visible: true,
        }
    }

    pub(crate) fn new_internal(children: Vec<GenPointer>, keys: Vec<Vec<u8>>) -> Self {
        Self {
            kind: NodeKind::Internal,
            children,
            keys,
            ..Self::new_leaf()
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Pointer to this node as a parent or sibling would record it.
    pub(crate) fn pointer(&self) -> GenPointer {
        GenPointer::new(self.page.unwrap_or_default(), self.generation)
    }

    pub(crate) fn first_key(&self) -> Option<&[u8]> {
        self.keys.first().map(Vec::as_slice)
    }

    pub(crate) fn last_key(&self) -> Option<&[u8]> {
        self.keys.last().map(Vec::as_slice)
    }

    /// Binary search for `key` among this node's keys.
    pub(crate) fn search<C>(&self, key: &[u8], cmp: C) -> std::result::Result<usize, usize>
    where
        C: Fn(&[u8], &[u8]) -> Ordering,
    {
        self.keys.binary_search_by(|probe| cmp(probe.as_slice(), key))
    }

    /// Index of the child whose range contains `key`.
    pub(crate) fn child_index<C>(&self, key: &[u8], cmp: C) -> usize
    where
        C: Fn(&[u8], &[u8]) -> Ordering,
    {
        self.keys
            .partition_point(|probe| cmp(probe.as_slice(), key) != Ordering::Greater)
    }

    fn entry_len(&self, idx: usize, format: &EntryFormat) -> usize {
        match self.kind {
            NodeKind::Leaf => format.key_len(&self.keys[idx]) + format.value_len(&self.values[idx]),
            NodeKind::Internal => format.key_len(&self.keys[idx]) + POINTER_LEN,
        }
    }

    /// Encoded size of the entry region.
    pub(crate) fn payload_len(&self, format: &EntryFormat) -> usize {
        let base = match self.kind {
            NodeKind::Leaf => 0,
            NodeKind::Internal => POINTER_LEN,
        };
        base + (0..self.keys.len())
            .map(|idx| self.entry_len(idx, format))
            .sum::<usize>()
    }

    /// Splits at the byte midpoint. `self` keeps the left half and its page;
    /// the returned node has no page yet. Returns `(separator, right)`.
    pub(crate) fn split(&mut self, format: &EntryFormat) -> Result<(Vec<u8>, Node)> {
        let n = self.keys.len();
        let sizes: Vec<usize> = (0..n).map(|idx| self.entry_len(idx, format)).collect();
        let total: usize = sizes.iter().sum();
        let (lo, hi) = match self.kind {
            NodeKind::Leaf if n >= 2 => (1, n - 1),
            NodeKind::Internal if n >= 3 => (1, n - 2),
            NodeKind::Internal if n == 2 => (1, 1),
            _ => return Err(TreeError::Corruption("node too small to split")),
        };
        let mut best = lo;
        let mut best_cost = usize::MAX;
        let mut prefix: usize = sizes[..lo].iter().sum();
        for m in lo..=hi {
            let (left, right) = match self.kind {
                NodeKind::Leaf => (prefix, total - prefix),
                NodeKind::Internal => (prefix, total - prefix - sizes[m]),
            };
            let cost = left.abs_diff(right);
            if cost < best_cost {
                best_cost = cost;
                best = m;
            }
            prefix += sizes[m];
        }
        let mut right = match self.kind {
            NodeKind::Leaf => {
                let keys = self.keys.split_off(best);
                let values = self.values.split_off(best);
                let mut right = Node::new_leaf();
                right.keys = keys;
                right.values = values;
                right
            }
            NodeKind::Internal => {
                let keys = self.keys.split_off(best + 1);
                let children = self.children.split_off(best + 1);
                Node::new_internal(children, keys)
            }
        };
        let separator = match self.kind {
            NodeKind::Leaf => right.keys[0].clone(),
            NodeKind::Internal => self
                .keys
                .pop()
                .ok_or(TreeError::Corruption("internal split lost its separator"))?,
        };
        right.generation = self.generation;
        Ok((separator, right))
    }

    /// Appends `right` to this node; internal nodes pull `separator` down.
    pub(crate) fn absorb(&mut self, separator: Vec<u8>, mut right: Node) {
        if self.kind == NodeKind::Internal {
            self.keys.push(separator);
            self.children.append(&mut right.children);
        } else {
            self.values.append(&mut right.values);
        }
        self.keys.append(&mut right.keys);
    }

    /// Serialises into `buf`. The node must have a page assigned.
    pub(crate) fn encode(&self, buf: &mut [u8], format: &EntryFormat, salt: u64) -> Result<()> {
        let page = self
            .page
            .ok_or(TreeError::Invalid("node has no page assigned"))?;
        if self.payload_len(format) > buf.len().saturating_sub(NODE_HEADER_LEN) {
            return Err(TreeError::Invalid("node does not fit in page"));
        }
        let key_count = u16::try_from(self.keys.len())
            .map_err(|_| TreeError::Invalid("node has too many keys"))?;
        buf.fill(0);
        PageHeader::new(page, self.kind.page_kind(), buf.len() as u32, salt)?.encode(buf)?;
        put_u16(buf, KEY_COUNT, key_count);
        put_u64(buf, GENERATION, self.generation);
        pointer::init_pair(&mut buf[RIGHT_SIBLING], self.right, self.generation);
        pointer::init_pair(&mut buf[LEFT_SIBLING], self.left, self.generation);

        let mut at = NODE_HEADER_LEN;
        match self.kind {
            NodeKind::Leaf => {
                for (key, value) in self.keys.iter().zip(&self.values) {
                    at = put_bytes(buf, at, format.key_size, key)?;
                    at = put_bytes(buf, at, format.value_size, value)?;
                }
            }
            NodeKind::Internal => {
                let first = self
                    .children
                    .first()
                    .ok_or(TreeError::Invalid("internal node without children"))?;
                first.encode(&mut buf[at..at + POINTER_LEN]);
                at += POINTER_LEN;
                for (key, child) in self.keys.iter().zip(&self.children[1..]) {
                    at = put_bytes(buf, at, format.key_size, key)?;
                    child.encode(&mut buf[at..at + POINTER_LEN]);
                    at += POINTER_LEN;
                }
            }
        }
        let crc = node_crc32(page.0, salt, buf);
        buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Parses a node page, resolving sibling pointers for a reader at
    /// `(stable, unstable)`.
    pub(crate) fn decode(
        buf: &[u8],
        page: PageId,
        format: &EntryFormat,
        salt: u64,
        stable: u64,
        unstable: u64,
    ) -> Result<Node> {
        let header = PageHeader::decode(buf)?;
        let kind = match header.kind {
            PageKind::TreeLeaf => NodeKind::Leaf,
            PageKind::TreeInternal => NodeKind::Internal,
            _ => return Err(TreeError::Corruption("not a tree node page")),
        };
        if header.page_no != page {
            return Err(TreeError::Corruption("node page number mismatch"));
        }
        if header.salt != salt {
            return Err(TreeError::Corruption("node page salt mismatch"));
        }
        if node_crc32(page.0, salt, buf) != header.crc32 {
            return Err(TreeError::Corruption("node page checksum mismatch"));
        }
        let key_count = get_u16(buf, KEY_COUNT) as usize;
        let right = pointer::read_pair(&buf[RIGHT_SIBLING], stable, unstable);
        let left = pointer::read_pair(&buf[LEFT_SIBLING], stable, unstable);
        let mut node = Node {
            page: Some(page),
            generation: raw_generation(buf),
            kind,
            keys: Vec::with_capacity(key_count),
            values: Vec::new(),
            children: Vec::new(),
            left: left.unwrap_or(GenPointer::NULL),
            right: right.unwrap_or(GenPointer::NULL),
            links_visible: left.is_some() && right.is_some(),
        };

        let mut at = NODE_HEADER_LEN;
        match kind {
            NodeKind::Leaf => {
                node.values.reserve(key_count);
                for _ in 0..key_count {
                    let (key, next) = take_bytes(buf, at, format.key_size)?;
                    let (value, next) = take_bytes(buf, next, format.value_size)?;
                    node.keys.push(key);
                    node.values.push(value);
                    at = next;
                }
            }
            NodeKind::Internal => {
                node.children.reserve(key_count + 1);
                node.children.push(take_pointer(buf, at)?);
                at += POINTER_LEN;
                for _ in 0..key_count {
                    let (key, next) = take_bytes(buf, at, format.key_size)?;
                    node.keys.push(key);
                    node.children.push(take_pointer(buf, next)?);
                    at = next + POINTER_LEN;
                }
            }
        }
        Ok(node)
    }
}

fn put_bytes(buf: &mut [u8], at: usize, fixed: Option<usize>, bytes: &[u8]) -> Result<usize> {
    let mut at = at;
    match fixed {
        Some(size) if size != bytes.len() => {
            return Err(TreeError::Invalid("entry length differs from the layout size"));
        }
        Some(_) => {}
        None => {
            let len = u16::try_from(bytes.len())
                .map_err(|_| TreeError::Invalid("entry longer than 64 KiB"))?;
            put_u16(buf, at, len);
            at += LEN_PREFIX;
        }
    }
    buf[at..at + bytes.len()].copy_from_slice(bytes);
    Ok(at + bytes.len())
}

fn take_bytes(buf: &[u8], at: usize, fixed: Option<usize>) -> Result<(Vec<u8>, usize)> {
    let (len, start) = match fixed {
        Some(size) => (size, at),
        None => {
            if at + LEN_PREFIX > buf.len() {
                return Err(TreeError::Corruption("node entry out of bounds"));
            }
            (get_u16(buf, at) as usize, at + LEN_PREFIX)
        }
    };
    let end = start + len;
    if end > buf.len() {
        return Err(TreeError::Corruption("node entry out of bounds"));
    }
    Ok((buf[start..end].to_vec(), end))
}

fn take_pointer(buf: &[u8], at: usize) -> Result<GenPointer> {
    if at + POINTER_LEN > buf.len() {
        return Err(TreeError::Corruption("child pointer out of bounds"));
    }
    Ok(GenPointer::decode(&buf[at..at + POINTER_LEN]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXED: EntryFormat = EntryFormat {
        key_size: Some(8),
        value_size: Some(8),
    };
    const VARIABLE: EntryFormat = EntryFormat {
        key_size: None,
        value_size: None,
    };

    fn key(v: u64) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    fn leaf_with(range: std::ops::Range<u64>) -> Node {
        let mut node = Node::new_leaf();
        for v in range {
            node.keys.push(key(v));
            node.values.push(key(v * 2));
        }
        node
    }

    #[test]
    fn leaf_roundtrip_fixed() -> Result<()> {
        let mut node = leaf_with(0..20);
        node.page = Some(PageId(5));
        node.generation = 3;
        node.right = GenPointer::new(PageId(6), 3);
        let mut buf = vec![0u8; 1024];
        node.encode(&mut buf, &FIXED, 99)?;
        let decoded = Node::decode(&buf, PageId(5), &FIXED, 99, 2, 3)?;
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.values, node.values);
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.right, GenPointer::new(PageId(6), 3));
        assert!(decoded.left.is_null());
        assert!(decoded.links_visible);
        Ok(())
    }

    #[test]
    fn internal_roundtrip_variable() -> Result<()> {
        let children = vec![
            GenPointer::new(PageId(2), 1),
            GenPointer::new(PageId(3), 1),
            GenPointer::new(PageId(4), 2),
        ];
        let mut node = Node::new_internal(children.clone(), vec![b"m".to_vec(), b"t".to_vec()]);
        node.page = Some(PageId(9));
        node.generation = 2;
        let mut buf = vec![0u8; 1024];
        node.encode(&mut buf, &VARIABLE, 1)?;
        let decoded = Node::decode(&buf, PageId(9), &VARIABLE, 1, 1, 2)?;
        assert_eq!(decoded.kind, NodeKind::Internal);
        assert_eq!(decoded.children, children);
        assert_eq!(decoded.keys, vec![b"m".to_vec(), b"t".to_vec()]);
        Ok(())
    }

    #[test]
    fn checksum_ignores_sibling_pairs_but_not_entries() -> Result<()> {
        let mut node = leaf_with(0..4);
        node.page = Some(PageId(5));
        node.generation = 3;
        let mut buf = vec![0u8; 1024];
        node.encode(&mut buf, &FIXED, 7)?;

        pointer::write_pair(&mut buf[RIGHT_SIBLING], GenPointer::new(PageId(8), 4), 3, 4);
        let decoded = Node::decode(&buf, PageId(5), &FIXED, 7, 3, 4)?;
        assert_eq!(decoded.right, GenPointer::new(PageId(8), 4));

        buf[NODE_HEADER_LEN + 3] ^= 0x40;
        assert!(matches!(
            Node::decode(&buf, PageId(5), &FIXED, 7, 3, 4),
            Err(TreeError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn decode_rejects_foreign_page_number() -> Result<()> {
        let mut node = leaf_with(0..2);
        node.page = Some(PageId(5));
        let mut buf = vec![0u8; 1024];
        node.encode(&mut buf, &FIXED, 7)?;
        assert!(Node::decode(&buf, PageId(6), &FIXED, 7, 0, 1).is_err());
        Ok(())
    }

    #[test]
    fn leaf_split_balances_bytes() -> Result<()> {
        let mut node = leaf_with(0..10);
        node.page = Some(PageId(3));
        node.generation = 4;
        let (sep, right) = node.split(&FIXED)?;
        assert_eq!(node.keys.len(), 5);
        assert_eq!(right.keys.len(), 5);
        assert_eq!(sep, key(5));
        assert_eq!(right.page, None);
        assert_eq!(node.page, Some(PageId(3)));
        Ok(())
    }

    #[test]
    fn internal_split_promotes_middle_key() -> Result<()> {
        let children: Vec<GenPointer> = (1..=6).map(|p| GenPointer::new(PageId(p), 1)).collect();
        let keys: Vec<Vec<u8>> = (1..=5).map(key).collect();
        let mut node = Node::new_internal(children, keys);
        let (sep, right) = node.split(&FIXED)?;
        assert_eq!(sep, key(3));
        assert_eq!(node.keys, vec![key(1), key(2)]);
        assert_eq!(node.children.len(), 3);
        assert_eq!(right.keys, vec![key(4), key(5)]);
        assert_eq!(right.children.len(), 3);
        Ok(())
    }

    #[test]
    fn absorb_pulls_separator_into_internal() {
        let mut left = Node::new_internal(
            vec![GenPointer::new(PageId(1), 1), GenPointer::new(PageId(2), 1)],
            vec![key(10)],
        );
        let right = Node::new_internal(
            vec![GenPointer::new(PageId(3), 1), GenPointer::new(PageId(4), 1)],
            vec![key(30)],
        );
        left.absorb(key(20), right);
        assert_eq!(left.keys, vec![key(10), key(20), key(30)]);
        assert_eq!(left.children.len(), 4);
    }

    #[test]
    fn child_index_routes_equal_keys_right() {
        let node = Node::new_internal(
            vec![
                GenPointer::new(PageId(1), 1),
                GenPointer::new(PageId(2), 1),
                GenPointer::new(PageId(3), 1),
            ],
            vec![key(10), key(20)],
        );
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
        assert_eq!(node.child_index(&key(5), cmp), 0);
        assert_eq!(node.child_index(&key(10), cmp), 1);
        assert_eq!(node.child_index(&key(19), cmp), 1);
        assert_eq!(node.child_index(&key(20), cmp), 2);
        assert_eq!(node.child_index(&key(99), cmp), 2);
    }

    #[test]
    fn max_entry_leaves_room_for_four_entries() {
        let page_size = 1024;
        assert!(4 * (max_entry_len(page_size) + POINTER_LEN) <= capacity(page_size));
    }
}
