use rand::Rng;

use crate::distance::load_u64_le;

const WORD_BITS: usize = u64::BITS as usize;

/// The bit positions one hash table samples from every row.
///
/// The mask is packed into 64-bit words laid over the row's little-endian
/// byte image: bit `b` of the row lives in word `b / 64`, at bit `b % 64`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BitMask {
    words: Vec<u64>,
    key_size: usize,
}

impl BitMask {
    /// Pick `key_size` distinct bit positions uniformly at random out of a
    /// row that is `feature_bytes` long.
    ///
    /// The caller guarantees `key_size <= feature_bytes * 8` and `key_size <= 64`.
    pub fn random(feature_bytes: usize, key_size: usize, rng: &mut impl Rng) -> Self {
        let total_bits = feature_bytes * 8;
        let mut words = vec![0u64; feature_bytes.div_ceil(8)];
        for bit in rand::seq::index::sample(rng, total_bits, key_size).iter() {
            words[bit / WORD_BITS] |= 1u64 << (bit % WORD_BITS);
        }
        Self { words, key_size }
    }

    /// Build a mask from explicit bit positions. Duplicates are ignored.
    pub fn from_bits(feature_bytes: usize, bits: &[usize]) -> Self {
        let mut words = vec![0u64; feature_bytes.div_ceil(8)];
        for &bit in bits {
            words[bit / WORD_BITS] |= 1u64 << (bit % WORD_BITS);
        }
        let key_size = words.iter().map(|w| w.count_ones() as usize).sum();
        Self { words, key_size }
    }

    /// Number of sampled bits, i.e. the width of the derived key.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Row length in bytes this mask was laid out for, rounded up to a word.
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Sampled bit positions in ascending order.
    pub fn bits(&self) -> Vec<usize> {
        let mut bits = Vec::with_capacity(self.key_size);
        for (w, &word) in self.words.iter().enumerate() {
            let mut m = word;
            while m != 0 {
                bits.push(w * WORD_BITS + m.trailing_zeros() as usize);
                m &= m - 1;
            }
        }
        bits
    }

    /// Compute the sub-signature of a row.
    ///
    /// Given the row `ABCDEF` and the mask `001011`, the key is `CEF`: the
    /// sampled bits are packed densely, lowest mask bit first, so the key is
    /// independent of where the sampled bits sit inside the row.
    #[inline]
    pub fn key(&self, bytes: &[u8]) -> u64 {
        let mut key = 0u64;
        let mut weight = 0u32;
        for (w, &mask_word) in self.words.iter().enumerate() {
            if mask_word == 0 {
                continue;
            }
            let end = ((w + 1) * 8).min(bytes.len());
            let start = (w * 8).min(end);
            let feature_word = load_u64_le(&bytes[start..end]);

            let mut m = mask_word;
            while m != 0 {
                let lowest = m & m.wrapping_neg();
                if feature_word & lowest != 0 {
                    key |= 1u64 << weight;
                }
                m ^= lowest;
                weight += 1;
            }
        }
        key
    }
}

/// XOR masks for multi-probe lookups.
///
/// Returns every mask over `key_size` bits with at most `level` bits set,
/// ordered by number of flipped bits (the exact bucket, mask `0`, first).
pub fn probe_masks(key_size: usize, level: usize) -> Vec<u64> {
    let mut masks = vec![0u64];
    fill_xor_masks(0, 0, key_size, level, &mut masks);
    masks.sort_unstable_by_key(|m| (m.count_ones(), *m));
    masks
}

fn fill_xor_masks(key: u64, lowest_index: usize, key_size: usize, level: usize, out: &mut Vec<u64>) {
    if level == 0 {
        return;
    }
    for i in lowest_index..key_size {
        let flipped = key | (1u64 << i);
        out.push(flipped);
        fill_xor_masks(flipped, i + 1, key_size, level - 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_mask_has_key_size_bits() {
        let mut rng = StdRng::seed_from_u64(42);
        let mask = BitMask::random(32, 12, &mut rng);
        assert_eq!(mask.key_size(), 12);
        assert_eq!(mask.bits().len(), 12);
        assert!(mask.bits().iter().all(|&b| b < 256));
    }

    #[test]
    fn test_key_packs_sampled_bits_densely() {
        // Bits 3 and 70 sit in different words but become key bits 0 and 1.
        let mask = BitMask::from_bits(16, &[3, 70]);
        let mut row = [0u8; 16];
        assert_eq!(mask.key(&row), 0);
        row[0] = 0b0000_1000;
        assert_eq!(mask.key(&row), 0b01);
        row[8] = 0b0100_0000;
        assert_eq!(mask.key(&row), 0b11);
        row[0] = 0;
        assert_eq!(mask.key(&row), 0b10);
    }

    #[test]
    fn test_key_on_partial_trailing_word() {
        // 10-byte row: the second mask word only covers 2 bytes.
        let mask = BitMask::from_bits(10, &[79]);
        let mut row = [0u8; 10];
        row[9] = 0x80;
        assert_eq!(mask.key(&row), 1);
    }

    #[test]
    fn test_deterministic_key() {
        let mut rng = StdRng::seed_from_u64(7);
        let mask = BitMask::random(8, 16, &mut rng);
        let row = [0x5Au8, 0xC3, 0x01, 0xFF, 0x00, 0x10, 0x20, 0x7E];
        assert_eq!(mask.key(&row), mask.key(&row));
        assert!(mask.key(&row) < (1 << 16));
    }

    #[test]
    fn test_probe_masks() {
        assert_eq!(probe_masks(4, 0), vec![0]);

        let one = probe_masks(4, 1);
        assert_eq!(one, vec![0, 0b0001, 0b0010, 0b0100, 0b1000]);

        // 1 + C(4,1) + C(4,2)
        let two = probe_masks(4, 2);
        assert_eq!(two.len(), 11);
        assert!(two.iter().all(|m| m.count_ones() <= 2));
    }
}
