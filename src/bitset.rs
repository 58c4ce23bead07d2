use crate::error::{LshError, Result};

/// Packed bit array without bounds checks in release builds.
///
/// Used as an O(1) "is this key populated" filter in front of a bucket map,
/// and as the per-query dedup set for candidate indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct DynamicBitset {
    words: Vec<u64>,
    size: usize,
}

const WORD_BITS: usize = u64::BITS as usize;

impl DynamicBitset {
    /// A bitset of `size` bits, all zero.
    pub fn new(size: usize) -> Self {
        let mut bitset = Self::default();
        bitset.resize(size);
        bitset
    }

    /// Like [`new`](DynamicBitset::new), but reports an allocation failure
    /// instead of aborting. Used for key-space sized sets.
    pub fn try_new(size: usize) -> Result<Self> {
        let len = size.div_ceil(WORD_BITS);
        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|_| LshError::Allocation {
                bytes: len * std::mem::size_of::<u64>(),
            })?;
        words.resize(len, 0);
        Ok(Self { words, size })
    }

    /// Resize to hold `size` bits. Newly added bits are zero.
    pub fn resize(&mut self, size: usize) {
        self.size = size;
        self.words.resize(size.div_ceil(WORD_BITS), 0);
    }

    /// Release the backing storage.
    pub fn clear(&mut self) {
        self.words = Vec::new();
        self.size = 0;
    }

    /// True when no storage is held.
    pub fn empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Set every bit to 0.
    pub fn reset(&mut self) {
        self.words.fill(0);
    }

    #[inline]
    pub fn reset_bit(&mut self, index: usize) {
        debug_assert!(index < self.size);
        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
    }

    /// Zero the whole word holding `index`. Cheaper than [`reset_bit`] when
    /// the caller is clearing every bit it previously set.
    ///
    /// [`reset_bit`]: DynamicBitset::reset_bit
    #[inline]
    pub fn reset_block(&mut self, index: usize) {
        self.words[index / WORD_BITS] = 0;
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.size);
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    #[inline]
    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.size);
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    /// Number of bits the set holds.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when the backing words hold exactly `size` bits.
    pub(crate) fn is_consistent(&self) -> bool {
        self.words.len() == self.size.div_ceil(WORD_BITS)
    }

    /// Heap bytes used by the backing words.
    pub fn memory_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }
}
