//! Hamming distance functors over little-endian byte images.
//!
//! All three forms count the bits that differ between two rows and agree for
//! every input length; the word-wise forms only exist for throughput.

/// Distance used to re-rank candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum DistanceMetric {
    /// Byte-wise XOR, popcount through a 256-entry lookup table.
    HammingLut,
    /// 64-bit word XOR with hardware popcount.
    #[default]
    HammingPopcnt,
    /// 32-bit word XOR with a portable SWAR popcount.
    Hamming32,
}

impl DistanceMetric {
    /// Number of differing bits between `a` and `b`.
    #[inline]
    pub fn compute(&self, a: &[u8], b: &[u8]) -> u32 {
        match self {
            DistanceMetric::HammingLut => hamming_lut(a, b),
            DistanceMetric::HammingPopcnt => hamming_popcnt(a, b),
            DistanceMetric::Hamming32 => hamming_popcnt32(a, b),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::HammingLut => "hamming_lut",
            DistanceMetric::HammingPopcnt => "hamming_popcnt",
            DistanceMetric::Hamming32 => "hamming32",
        }
    }
}

const BYTE_POPCOUNT: [u8; 256] = build_byte_popcount();

const fn build_byte_popcount() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        table[i] = (i & 1) as u8 + table[i >> 1];
        i += 1;
    }
    table
}

/// Set-bit count of one byte, from the lookup table.
#[inline]
pub fn byte_bits(b: u8) -> u32 {
    BYTE_POPCOUNT[b as usize] as u32
}

/// Load up to 8 bytes as a little-endian word, zero-padding the high bytes.
#[inline]
pub(crate) fn load_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[inline]
fn load_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Hamming distance using the byte lookup table.
pub fn hamming_lut(a: &[u8], b: &[u8]) -> u32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| byte_bits(x ^ y)).sum()
}

/// Hamming distance over 64-bit words. A trailing partial word is
/// zero-padded on both sides so the padding never contributes.
pub fn hamming_popcnt(a: &[u8], b: &[u8]) -> u32 {
    debug_assert_eq!(a.len(), b.len());
    let mut chunks_a = a.chunks_exact(8);
    let mut chunks_b = b.chunks_exact(8);
    let mut result: u32 = chunks_a
        .by_ref()
        .zip(chunks_b.by_ref())
        .map(|(x, y)| (load_u64_le(x) ^ load_u64_le(y)).count_ones())
        .sum();

    let (rest_a, rest_b) = (chunks_a.remainder(), chunks_b.remainder());
    if !rest_a.is_empty() {
        result += (load_u64_le(rest_a) ^ load_u64_le(rest_b)).count_ones();
    }
    result
}

/// Hamming distance over 32-bit words with the SWAR popcount.
pub fn hamming_popcnt32(a: &[u8], b: &[u8]) -> u32 {
    debug_assert_eq!(a.len(), b.len());
    let mut chunks_a = a.chunks_exact(4);
    let mut chunks_b = b.chunks_exact(4);
    let mut result: u32 = chunks_a
        .by_ref()
        .zip(chunks_b.by_ref())
        .map(|(x, y)| popcnt32(load_u32_le(x) ^ load_u32_le(y)))
        .sum();

    let (rest_a, rest_b) = (chunks_a.remainder(), chunks_b.remainder());
    if !rest_a.is_empty() {
        result += popcnt32(load_u32_le(rest_a) ^ load_u32_le(rest_b));
    }
    result
}

/// Population count without hardware support (Hamming weight, "popcount_3").
#[inline]
pub fn popcnt32(mut n: u32) -> u32 {
    n -= (n >> 1) & 0x5555_5555;
    n = (n & 0x3333_3333) + ((n >> 2) & 0x3333_3333);
    (((n + (n >> 4)) & 0x0F0F_0F0F).wrapping_mul(0x0101_0101)) >> 24
}
