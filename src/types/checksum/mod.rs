#![forbid(unsafe_code)]

/// Streaming checksum used by the page codecs.
pub trait Checksum {
    /// Clears any accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a whole page payload, bound to its page number and the file salt.
pub fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    page_crc32_parts(page_no, salt, &[payload])
}

/// Like [`page_crc32`] but over several disjoint regions of a page.
pub fn page_crc32_parts(page_no: u64, salt: u64, parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Plain CRC32 of a small record that carries no page binding.
pub fn record_crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
