//! One randomized LSH hash table.
//!
//! A table owns its [`BitMask`] (its hash function), an arena holding every
//! bucket's feature indices, and a [`Storage`] that maps keys to buckets. The
//! storage starts as a plain hash map and is re-evaluated after each bulk
//! insertion: dense tables switch to a directly indexed array, sparse tables
//! with an affordable key space get a bitset in front of the map.

use std::fmt;

use hashbrown::HashMap;
use rand::Rng;

use crate::allocator::{PooledArena, Span};
use crate::bitset::DynamicBitset;
use crate::element::Element;
use crate::error::{LshError, Result};
use crate::hash::BitMask;

/// What is stored in a bucket: a row position in the dataset.
pub type FeatureIndex = u32;

/// The key a bucket is found under, `< 2^key_size`.
pub type BucketKey = u64;

/// Largest supported key width in bits.
pub const MAX_KEY_SIZE: usize = 64;

/// Buckets start with room for this many entries when grown one at a time.
const MIN_BUCKET_CAPACITY: usize = 4;

/// Estimated bytes one populated key costs in the hash map: the key, the
/// bucket handle and hashbrown's control byte.
pub const MAP_ENTRY_BYTES: usize = std::mem::size_of::<(BucketKey, Bucket)>() + 1;

/// Upper bound on the bitset size accepted regardless of map size.
/// 512 MiB is exactly a 32-bit key space.
pub const MAX_BITSET_BYTES: u128 = 1 << 29;

/// A bucket: a growable run of feature indices living in the table's arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Bucket {
    span: Span,
    len: u32,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.span.len()
    }

    /// Make room for `additional` more entries, growing to the exact size.
    fn reserve(
        &mut self,
        arena: &mut PooledArena<FeatureIndex>,
        additional: usize,
    ) -> Result<()> {
        let needed = self.len() + additional;
        if needed > self.capacity() {
            self.span = arena.grow(self.span, needed)?;
        }
        Ok(())
    }

    fn push(&mut self, arena: &mut PooledArena<FeatureIndex>, value: FeatureIndex) -> Result<()> {
        if self.len() == self.capacity() {
            let new_capacity = (self.capacity() * 2).max(MIN_BUCKET_CAPACITY);
            self.span = arena.grow(self.span, new_capacity)?;
        }
        arena.get_mut(self.span)[self.len()] = value;
        self.len += 1;
        Ok(())
    }

    fn entries<'a>(&self, arena: &'a PooledArena<FeatureIndex>) -> &'a [FeatureIndex] {
        &arena.get(self.span)[..self.len()]
    }
}

/// Which storage strategy a table currently uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Representation {
    /// Dense array of `2^key_size` buckets indexed by key.
    Array,
    /// Hash map guarded by a bitset of populated keys.
    BitsetHash,
    /// Hash map only.
    Hash,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Representation::Array => "array",
            Representation::BitsetHash => "bitset-hash",
            Representation::Hash => "hash",
        })
    }
}

/// Occupancy figures the representation choice is made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyStats {
    pub key_size: usize,
    pub populated_keys: usize,
}

impl OccupancyStats {
    pub fn key_space(&self) -> u128 {
        1u128 << self.key_size
    }

    /// Bytes a bitset over the whole key space takes.
    pub fn bitset_bytes(&self) -> u128 {
        self.key_space().div_ceil(8)
    }

    /// Estimated bytes of the sparse map at this occupancy.
    pub fn map_bytes(&self) -> u128 {
        self.populated_keys as u128 * MAP_ENTRY_BYTES as u128
    }
}

/// Decide the storage strategy after a bulk insertion.
///
/// `Array` is terminal. More than half the key space populated selects
/// `Array`. Otherwise the bitset is added when it costs at most a tenth of the
/// map, or fits within [`MAX_BITSET_BYTES`].
pub fn next_representation(current: Representation, stats: OccupancyStats) -> Representation {
    if current == Representation::Array {
        return Representation::Array;
    }
    if stats.populated_keys as u128 > stats.key_space() / 2 {
        return Representation::Array;
    }
    let bitset = stats.bitset_bytes();
    if bitset * 10 <= stats.map_bytes() || bitset <= MAX_BITSET_BYTES {
        Representation::BitsetHash
    } else {
        Representation::Hash
    }
}

/// Key → bucket storage, one variant per [`Representation`].
#[derive(Debug)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Storage {
    Array(Vec<Bucket>),
    BitsetHash {
        buckets: HashMap<BucketKey, Bucket>,
        bitset: DynamicBitset,
    },
    Hash(HashMap<BucketKey, Bucket>),
}

impl Storage {
    pub fn representation(&self) -> Representation {
        match self {
            Storage::Array(_) => Representation::Array,
            Storage::BitsetHash { .. } => Representation::BitsetHash,
            Storage::Hash(_) => Representation::Hash,
        }
    }

    /// The bucket for `key`, creating it if needed.
    fn slot_mut(&mut self, key: BucketKey) -> &mut Bucket {
        match self {
            Storage::Array(slots) => &mut slots[key as usize],
            Storage::BitsetHash { buckets, bitset } => {
                bitset.set(key as usize);
                buckets.entry(key).or_default()
            }
            Storage::Hash(buckets) => buckets.entry(key).or_default(),
        }
    }

    fn get(&self, key: BucketKey) -> Option<&Bucket> {
        match self {
            Storage::Array(slots) => slots.get(key as usize),
            Storage::BitsetHash { buckets, bitset } => {
                if bitset.test(key as usize) {
                    buckets.get(&key)
                } else {
                    None
                }
            }
            Storage::Hash(buckets) => buckets.get(&key),
        }
    }

    fn populated_keys(&self) -> usize {
        match self {
            Storage::Array(slots) => slots.iter().filter(|b| !b.is_empty()).count(),
            Storage::BitsetHash { buckets, .. } | Storage::Hash(buckets) => buckets.len(),
        }
    }

    fn buckets(&self) -> Box<dyn Iterator<Item = (BucketKey, &Bucket)> + '_> {
        match self {
            Storage::Array(slots) => Box::new(
                slots
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| !b.is_empty())
                    .map(|(k, b)| (k as BucketKey, b)),
            ),
            Storage::BitsetHash { buckets, .. } | Storage::Hash(buckets) => {
                Box::new(buckets.iter().map(|(k, b)| (*k, b)))
            }
        }
    }
}

fn key_space_len(key_size: usize) -> Result<usize> {
    usize::try_from(1u128 << key_size).map_err(|_| LshError::Allocation {
        bytes: usize::MAX,
    })
}

/// A single LSH hash table.
#[derive(Debug)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct LshTable {
    mask: BitMask,
    storage: Storage,
    arena: PooledArena<FeatureIndex>,
    feature_bytes: usize,
    len: usize,
}

impl LshTable {
    /// Create an empty table over rows of `feature_size` elements of type `T`,
    /// sampling `key_size` random bits.
    pub fn new<T: Element>(feature_size: usize, key_size: usize, rng: &mut impl Rng) -> Result<Self> {
        if !T::TYPE.supports_key_derivation() {
            return Err(LshError::UnsupportedElementType(T::TYPE));
        }
        let feature_bytes = feature_size * T::TYPE.size();
        let max = MAX_KEY_SIZE.min(feature_bytes * 8);
        if key_size == 0 || key_size > max {
            return Err(LshError::InvalidKeySize { key_size, max });
        }
        Ok(Self::with_mask(BitMask::random(feature_bytes, key_size, rng), feature_bytes))
    }

    /// Create an empty table with an explicit mask.
    pub fn with_mask(mask: BitMask, feature_bytes: usize) -> Self {
        Self {
            mask,
            storage: Storage::Hash(HashMap::new()),
            arena: PooledArena::new(),
            feature_bytes,
            len: 0,
        }
    }

    /// Bucket key of a row given as its byte image.
    #[inline]
    pub fn get_key(&self, bytes: &[u8]) -> BucketKey {
        self.mask.key(bytes)
    }

    /// Add one row under the current representation.
    pub fn add(&mut self, value: FeatureIndex, bytes: &[u8]) -> Result<()> {
        let key = self.get_key(bytes);
        self.storage.slot_mut(key).push(&mut self.arena, value)?;
        self.len += 1;
        Ok(())
    }

    /// Add a batch of rows, then re-evaluate the storage representation.
    ///
    /// Every bucket touched by the batch is grown once to its final size, so
    /// the arena holds no abandoned copies from incremental growth.
    pub fn add_batch(&mut self, features: &[(FeatureIndex, &[u8])]) -> Result<()> {
        let keyed: Vec<(BucketKey, FeatureIndex)> = features
            .iter()
            .map(|&(value, bytes)| (self.get_key(bytes), value))
            .collect();

        let mut counts: HashMap<BucketKey, usize> = HashMap::new();
        for &(key, _) in &keyed {
            *counts.entry(key).or_insert(0) += 1;
        }

        if let Storage::BitsetHash { buckets, .. } | Storage::Hash(buckets) = &mut self.storage {
            buckets.reserve(counts.len());
        }
        for (key, count) in counts {
            self.storage
                .slot_mut(key)
                .reserve(&mut self.arena, count)?;
        }
        for (key, value) in keyed {
            self.storage.slot_mut(key).push(&mut self.arena, value)?;
        }
        self.len += features.len();

        self.optimize()
    }

    /// Apply [`next_representation`] and migrate the storage if it changes.
    fn optimize(&mut self) -> Result<()> {
        let current = self.representation();
        let stats = self.occupancy();
        let next = next_representation(current, stats);
        if next == current {
            return Ok(());
        }

        let key_size = self.key_size();
        let storage = std::mem::replace(&mut self.storage, Storage::Hash(HashMap::new()));
        self.storage = match (storage, next) {
            (storage @ Storage::Array(_), _) => storage,
            (Storage::BitsetHash { buckets, .. } | Storage::Hash(buckets), Representation::Array) => {
                let len = key_space_len(key_size)?;
                let mut slots = Vec::new();
                slots
                    .try_reserve_exact(len)
                    .map_err(|_| LshError::Allocation {
                        bytes: len * std::mem::size_of::<Bucket>(),
                    })?;
                slots.resize(len, Bucket::default());
                for (key, bucket) in buckets {
                    slots[key as usize] = bucket;
                }
                Storage::Array(slots)
            }
            (Storage::BitsetHash { buckets, bitset }, Representation::BitsetHash) => {
                Storage::BitsetHash { buckets, bitset }
            }
            (Storage::Hash(buckets), Representation::BitsetHash) => {
                let mut bitset = DynamicBitset::try_new(key_space_len(key_size)?)?;
                for &key in buckets.keys() {
                    bitset.set(key as usize);
                }
                Storage::BitsetHash { buckets, bitset }
            }
            (Storage::BitsetHash { buckets, .. } | Storage::Hash(buckets), Representation::Hash) => {
                Storage::Hash(buckets)
            }
        };

        tracing::debug!(
            from = %current,
            to = %next,
            populated_keys = stats.populated_keys,
            key_size,
            "bucket storage representation changed"
        );
        Ok(())
    }

    /// Feature indices stored under `key`.
    ///
    /// `None` means the key was never populated. Array storage returns an
    /// empty slice instead; both mean "no candidates".
    #[inline]
    pub fn get_bucket_from_key(&self, key: BucketKey) -> Option<&[FeatureIndex]> {
        self.storage
            .get(key)
            .map(|bucket| bucket.entries(&self.arena))
    }

    /// Iterate over every non-empty bucket.
    pub fn buckets(&self) -> impl Iterator<Item = (BucketKey, &[FeatureIndex])> + '_ {
        self.storage
            .buckets()
            .map(|(key, bucket)| (key, bucket.entries(&self.arena)))
    }

    pub fn representation(&self) -> Representation {
        self.storage.representation()
    }

    pub fn occupancy(&self) -> OccupancyStats {
        OccupancyStats {
            key_size: self.key_size(),
            populated_keys: self.populated_keys(),
        }
    }

    pub fn populated_keys(&self) -> usize {
        self.storage.populated_keys()
    }

    pub fn key_size(&self) -> usize {
        self.mask.key_size()
    }

    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    /// Row length in bytes this table hashes.
    pub fn feature_bytes(&self) -> usize {
        self.feature_bytes
    }

    /// Total number of stored entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn arena_used_memory(&self) -> usize {
        self.arena.used_memory()
    }

    pub fn arena_wasted_memory(&self) -> usize {
        self.arena.wasted_memory()
    }

    /// Rough heap footprint of the table in bytes.
    pub fn memory_estimate_bytes(&self) -> usize {
        let storage = match &self.storage {
            Storage::Array(slots) => slots.len() * std::mem::size_of::<Bucket>(),
            Storage::BitsetHash { buckets, bitset } => {
                buckets.capacity() * MAP_ENTRY_BYTES + bitset.memory_bytes()
            }
            Storage::Hash(buckets) => buckets.capacity() * MAP_ENTRY_BYTES,
        };
        storage + self.arena.reserved_memory() + self.mask.word_count() * 8
    }

    /// Check a deserialized table against the index it is loaded into.
    ///
    /// Every stored entry must name a row below `rows`, every bucket must
    /// resolve in the arena, and the storage must cover the whole key space.
    #[cfg(feature = "persistence")]
    pub fn validate(&self, rows: usize, key_size: usize, feature_bytes: usize) -> Result<()> {
        let malformed = |msg: String| -> Result<()> { Err(LshError::Serialization(msg)) };

        if self.feature_bytes != feature_bytes {
            return malformed(format!(
                "table hashes {}-byte rows, dataset rows are {feature_bytes} bytes",
                self.feature_bytes
            ));
        }
        if key_size == 0 || key_size > MAX_KEY_SIZE {
            return malformed(format!("key size {key_size} out of range"));
        }
        let bits = self.mask.bits();
        if self.mask.key_size() != key_size || bits.len() != key_size {
            return malformed(format!(
                "table mask samples {} bits, expected {key_size}",
                bits.len()
            ));
        }
        if self.mask.word_count() != feature_bytes.div_ceil(8)
            || bits.iter().any(|&b| b >= feature_bytes * 8)
        {
            return malformed("table mask does not fit the row width".into());
        }

        let key_space = 1u128 << key_size;
        match &self.storage {
            Storage::Array(slots) if slots.len() as u128 != key_space => {
                return malformed(format!(
                    "array storage has {} slots for a {key_size}-bit key",
                    slots.len()
                ));
            }
            Storage::BitsetHash { buckets, bitset } => {
                if !bitset.is_consistent() || bitset.size() as u128 != key_space {
                    return malformed("bitset does not cover the key space".into());
                }
                if buckets.keys().any(|&k| (k as u128) >= key_space || !bitset.test(k as usize)) {
                    return malformed("bucket key missing from the bitset".into());
                }
            }
            Storage::Hash(buckets) if buckets.keys().any(|&k| (k as u128) >= key_space) => {
                return malformed(format!("bucket key wider than {key_size} bits"));
            }
            _ => {}
        }

        let mut total = 0usize;
        for (key, bucket) in self.storage.buckets() {
            let entries = self
                .arena
                .try_get(bucket.span)
                .filter(|span| bucket.len() <= span.len())
                .map(|span| &span[..bucket.len()]);
            let Some(entries) = entries else {
                return malformed(format!("bucket {key} does not resolve in the arena"));
            };
            if let Some(&bad) = entries.iter().find(|&&i| i as usize >= rows) {
                return malformed(format!("bucket {key} holds row {bad}, dataset has {rows}"));
            }
            total += entries.len();
        }
        if total != self.len {
            return malformed(format!("table counts {} entries, buckets hold {total}", self.len));
        }
        Ok(())
    }

    /// Bucket size statistics.
    pub fn stats(&self) -> LshStats {
        let mut sizes: Vec<usize> = self.storage.buckets().map(|(_, b)| b.len()).collect();
        sizes.sort_unstable();
        LshStats::from_sorted_sizes(sizes)
    }
}

/// Width of one bin of the bucket-size histogram.
const HISTOGRAM_BIN_WIDTH: usize = 20;

/// Bucket-size statistics of one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LshStats {
    /// Sizes of the non-empty buckets, ascending.
    pub bucket_sizes: Vec<usize>,
    pub n_buckets: usize,
    pub bucket_size_mean: f64,
    pub bucket_size_median: usize,
    pub bucket_size_min: usize,
    pub bucket_size_max: usize,
    pub bucket_size_std_dev: f64,
    /// `[first size, last size, number of buckets]` per non-empty bin.
    pub size_histogram: Vec<[usize; 3]>,
}

impl LshStats {
    fn from_sorted_sizes(sizes: Vec<usize>) -> Self {
        if sizes.is_empty() {
            return Self::default();
        }
        let n = sizes.len();
        let mean = sizes.iter().sum::<usize>() as f64 / n as f64;
        let variance = sizes
            .iter()
            .map(|&s| {
                let d = s as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;

        let mut size_histogram: Vec<[usize; 3]> = Vec::new();
        for &size in &sizes {
            let start = size / HISTOGRAM_BIN_WIDTH * HISTOGRAM_BIN_WIDTH;
            match size_histogram.last_mut() {
                Some(bin) if bin[0] == start => bin[2] += 1,
                _ => size_histogram.push([start, start + HISTOGRAM_BIN_WIDTH - 1, 1]),
            }
        }

        Self {
            n_buckets: n,
            bucket_size_mean: mean,
            bucket_size_median: sizes[n / 2],
            bucket_size_min: sizes[0],
            bucket_size_max: sizes[n - 1],
            bucket_size_std_dev: variance.sqrt(),
            size_histogram,
            bucket_sizes: sizes,
        }
    }
}

impl fmt::Display for LshStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lsh Table Stats:")?;
        writeln!(f, "{:>20}{}", "N buckets : ", self.n_buckets)?;
        writeln!(f, "{:>20}{:.1}", "mean size : ", self.bucket_size_mean)?;
        writeln!(f, "{:>20}{}", "median size : ", self.bucket_size_median)?;
        writeln!(f, "{:>20}{}", "min size : ", self.bucket_size_min)?;
        writeln!(f, "{:>20}{}", "max size : ", self.bucket_size_max)?;
        writeln!(f, "{:>20}{:.1}", "std dev : ", self.bucket_size_std_dev)?;
        write!(f, "{:>20}", "histogram : ")?;
        for [start, end, count] in &self.size_histogram {
            write!(f, "{start}-{end}: {count},  ")?;
        }
        Ok(())
    }
}
