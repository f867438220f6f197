//! Pluggable key/value encodings.

use std::cmp::Ordering;

use crate::types::{checksum::record_crc32, Result, TreeError};

/// Describes how keys and values are encoded inside tree pages.
///
/// A layout is shared read-only by every session of a tree. Its identity
/// (identifier, versions and entry sizes) is persisted in the metadata page
/// and must match on every later open.
pub trait Layout: Send + Sync + 'static {
    /// Decoded key type.
    type Key;
    /// Decoded value type.
    type Value;

    /// Stable identifier persisted in the metadata page.
    fn identifier(&self) -> u64;
    /// Major version; files written with another major version are rejected.
    fn major_version(&self) -> u32;
    /// Minor version; files written with another minor version are rejected.
    fn minor_version(&self) -> u32;
    /// Encoded key size, or `None` when keys vary in length.
    fn key_size(&self) -> Option<usize>;
    /// Encoded value size, or `None` when values vary in length.
    fn value_size(&self) -> Option<usize>;
    /// Appends the encoding of `key` to `out`.
    fn write_key(&self, key: &Self::Key, out: &mut Vec<u8>);
    /// Decodes a key previously produced by [`Layout::write_key`].
    fn read_key(&self, bytes: &[u8]) -> Result<Self::Key>;
    /// Appends the encoding of `value` to `out`.
    fn write_value(&self, value: &Self::Value, out: &mut Vec<u8>);
    /// Decodes a value previously produced by [`Layout::write_value`].
    fn read_value(&self, bytes: &[u8]) -> Result<Self::Value>;
    /// Total order over encoded keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Derives a layout identifier from a name and the entry sizes.
///
/// The high half is a CRC of the name, the low half packs the sizes
/// (0 meaning variable).
pub fn layout_identifier(name: &str, key_size: Option<usize>, value_size: Option<usize>) -> u64 {
    let sizes = ((key_size.unwrap_or(0) as u64 & 0xFFFF) << 16) | (value_size.unwrap_or(0) as u64 & 0xFFFF);
    ((record_crc32(name.as_bytes()) as u64) << 32) | sizes
}

fn decode_u64(bytes: &[u8], what: &'static str) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(TreeError::Corruption(what));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(arr))
}

/// `u64 -> u64` layout, stored either with fixed-size entries or with
/// length-prefixed ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct U64Layout {
    fixed: bool,
}

impl U64Layout {
    /// Entries stored without length prefixes.
    pub const fn fixed() -> Self {
        Self { fixed: true }
    }

    /// Entries stored with length prefixes.
    pub const fn dynamic() -> Self {
        Self { fixed: false }
    }

    fn size(&self) -> Option<usize> {
        self.fixed.then_some(8)
    }
}

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        layout_identifier("u64", self.size(), self.size())
    }

    fn major_version(&self) -> u32 {
        0
    }

    fn minor_version(&self) -> u32 {
        1
    }

    fn key_size(&self) -> Option<usize> {
        self.size()
    }

    fn value_size(&self) -> Option<usize> {
        self.size()
    }

    fn write_key(&self, key: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn read_key(&self, bytes: &[u8]) -> Result<u64> {
        decode_u64(bytes, "u64 key length mismatch")
    }

    fn write_value(&self, value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn read_value(&self, bytes: &[u8]) -> Result<u64> {
        decode_u64(bytes, "u64 value length mismatch")
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Variable-length byte string keys and values, ordered lexicographically.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BytesLayout;

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn identifier(&self) -> u64 {
        layout_identifier("bytes", None, None)
    }

    fn major_version(&self) -> u32 {
        0
    }

    fn minor_version(&self) -> u32 {
        1
    }

    fn key_size(&self) -> Option<usize> {
        None
    }

    fn value_size(&self) -> Option<usize> {
        None
    }

    fn write_key(&self, key: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn read_key(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn write_value(&self, value: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn read_value(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}
