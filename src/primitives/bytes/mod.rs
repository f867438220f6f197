#![forbid(unsafe_code)]
//! Big-endian field accessors for fixed page layouts.
//!
//! Callers index with offsets taken from layout constants, so an out-of-range
//! offset is a programming error and panics like any slice index.

/// Reads a big-endian `u16` at `at`.
pub fn get_u16(src: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&src[at..at + 2]);
    u16::from_be_bytes(raw)
}

/// Reads a big-endian `u32` at `at`.
pub fn get_u32(src: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(raw)
}

/// Reads a big-endian `u64` at `at`.
pub fn get_u64(src: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Writes a big-endian `u16` at `at`.
pub fn put_u16(dst: &mut [u8], at: usize, v: u16) {
    dst[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

/// Writes a big-endian `u32` at `at`.
pub fn put_u32(dst: &mut [u8], at: usize, v: u32) {
    dst[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

/// Writes a big-endian `u64` at `at`.
pub fn put_u64(dst: &mut [u8], at: usize, v: u64) {
    dst[at..at + 8].copy_from_slice(&v.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_big_endian() {
        let mut buf = [0u8; 16];
        put_u64(&mut buf, 0, 0x0102_0304_0506_0708);
        put_u32(&mut buf, 8, 0x0A0B_0C0D);
        put_u16(&mut buf, 12, 0xEEFF);
        assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(get_u64(&buf, 0), 0x0102_0304_0506_0708);
        assert_eq!(get_u32(&buf, 8), 0x0A0B_0C0D);
        assert_eq!(get_u16(&buf, 12), 0xEEFF);
    }
}
