use std::convert::TryFrom;

/// Infallible conversion from `u32`, for target types where `From<u32>` is not implemented because
/// the conversion is platform-dependent. We only support platforms on which `usize` is at least 32
/// bits wide (asserted in `main.rs`), so these cannot actually fail. A target type implements
/// `fromx` from only one source type, so unqualified calls resolve with both traits in scope.
pub trait FromU32 {
    fn fromx(n: u32) -> Self;
}

impl FromU32 for usize {
    fn fromx(n: u32) -> Self {
        usize::try_from(n).expect("usize is at least 32 bits wide")
    }
}

/// Infallible conversion from `usize` on platforms where `usize` is at most 64 bits wide.
pub trait FromUsize {
    fn fromx(n: usize) -> Self;
}

impl FromUsize for u64 {
    fn fromx(n: usize) -> Self {
        u64::try_from(n).expect("usize is at most 64 bits wide")
    }
}

/// Decodes the little-endian `u16` at `offset`.
/// PANICS: Panics if `buf` does not hold 2 bytes at `offset`. Callers validate buffer lengths
/// before decoding fixed-layout structures.
pub fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

/// Decodes the little-endian `u32` at `offset`.
/// PANICS: Panics if `buf` does not hold 4 bytes at `offset`.
pub fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Encodes `value` as a little-endian `u16` at `offset`.
/// PANICS: Panics if `buf` does not hold 2 bytes at `offset`.
pub fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Encodes `value` as a little-endian `u32` at `offset`.
/// PANICS: Panics if `buf` does not hold 4 bytes at `offset`.
pub fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
