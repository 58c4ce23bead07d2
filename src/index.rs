use std::borrow::Cow;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bitset::DynamicBitset;
use crate::dispatch::IndexKind;
use crate::distance::DistanceMetric;
use crate::element::{row_bytes, Element, ElementType};
use crate::error::{LshError, Result};
use crate::hash::probe_masks;
use crate::metrics::{BuildRecord, MetricsCollector, MetricsSnapshot, QueryRecord, Stopwatch};
use crate::table::{FeatureIndex, LshStats, LshTable, Representation, MAX_KEY_SIZE};

/// Construction parameters of an LSH index.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct IndexParams {
    /// Number of independent hash tables.
    pub table_number: usize,
    /// Bits sampled per table (1..=64, at most the row's bit width).
    pub key_size: usize,
    /// Maximum number of key bits flipped when probing neighbouring buckets.
    pub multi_probe_level: usize,
    /// Distance used to re-rank candidates.
    pub distance: DistanceMetric,
    /// Optional RNG seed for reproducible masks.
    pub seed: Option<u64>,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            table_number: 12,
            key_size: 20,
            multi_probe_level: 2,
            distance: DistanceMetric::HammingPopcnt,
            seed: None,
        }
    }
}

impl IndexParams {
    /// Check the parameters against rows that are `feature_bits` wide.
    pub fn validate(&self, feature_bits: usize) -> Result<()> {
        if self.table_number == 0 {
            return Err(LshError::ZeroTables);
        }
        let max = MAX_KEY_SIZE.min(feature_bits);
        if self.key_size == 0 || self.key_size > max {
            return Err(LshError::InvalidKeySize {
                key_size: self.key_size,
                max,
            });
        }
        if self.multi_probe_level > self.key_size {
            return Err(LshError::InvalidConfig(format!(
                "multi_probe_level ({}) cannot exceed key_size ({})",
                self.multi_probe_level, self.key_size
            )));
        }
        Ok(())
    }
}

/// Per-query search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchParams {
    /// Maximum number of distinct candidates scored per query. `None` scores
    /// every candidate retrieved.
    pub checks: Option<usize>,
}

impl SearchParams {
    pub fn unlimited() -> Self {
        Self { checks: None }
    }

    pub fn with_checks(checks: usize) -> Self {
        Self {
            checks: Some(checks),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.checks == Some(0) {
            return Err(LshError::InvalidConfig("checks must be greater than 0".into()));
        }
        Ok(())
    }
}

/// A single nearest-neighbor result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    /// Row of the neighbor in the dataset.
    pub index: FeatureIndex,
    /// Hamming distance to the query.
    pub distance: u32,
}

/// Aggregate statistics about the index.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub num_vectors: usize,
    pub num_tables: usize,
    pub key_size: usize,
    pub veclen: usize,
    pub total_buckets: usize,
    pub avg_bucket_size: f64,
    pub max_bucket_size: usize,
    pub representations: Vec<Representation>,
    pub arena_used_bytes: usize,
    pub arena_wasted_bytes: usize,
    pub memory_estimate_bytes: usize,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reprs: Vec<String> = self.representations.iter().map(|r| r.to_string()).collect();
        write!(
            f,
            "LshIndex {{ vectors: {}, tables: {}, key bits: {}, veclen: {}, \
             buckets: {}, avg_bucket: {:.1}, max_bucket: {}, storage: [{}], \
             arena: {:.1}KB used / {:.1}KB wasted, mem: ~{:.1}MB }}",
            self.num_vectors,
            self.num_tables,
            self.key_size,
            self.veclen,
            self.total_buckets,
            self.avg_bucket_size,
            self.max_bucket_size,
            reprs.join(", "),
            self.arena_used_bytes as f64 / 1024.0,
            self.arena_wasted_bytes as f64 / 1024.0,
            self.memory_estimate_bytes as f64 / (1024.0 * 1024.0),
        )
    }
}

// ---------------------------------------------------------------------------
// Build state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BuiltTables {
    tables: Vec<LshTable>,
    probe_masks: Vec<u64>,
}

#[derive(Debug)]
enum IndexState {
    Unbuilt,
    Built(BuiltTables),
}

// ---------------------------------------------------------------------------
// LshIndex
// ---------------------------------------------------------------------------

/// A bit-sampling locality-sensitive hashing index over the rows of a dataset.
///
/// The index is created unbuilt, populated once with [`build_index`], and
/// immutable afterwards: queries take `&self` and may run from many threads.
///
/// [`build_index`]: LshIndex::build_index
pub struct LshIndex<T: Element> {
    dataset: Arc<Array2<T>>,
    params: IndexParams,
    state: IndexState,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<T: Element> std::fmt::Debug for LshIndex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LshIndex")
            .field("element_type", &T::TYPE)
            .field("rows", &self.size())
            .field("veclen", &self.veclen())
            .field("params", &self.params)
            .field("built", &self.is_built())
            .field("has_metrics", &self.metrics.is_some())
            .finish()
    }
}

impl<T: Element> LshIndex<T> {
    /// Start configuring an index over `dataset`.
    pub fn builder(dataset: Arc<Array2<T>>) -> LshIndexBuilder<T> {
        LshIndexBuilder::new(dataset)
    }

    /// Create an unbuilt index. The configuration is validated before
    /// anything is allocated.
    pub fn new(dataset: Arc<Array2<T>>, params: IndexParams) -> Result<Self> {
        Self::new_with_metrics(dataset, params, false)
    }

    fn new_with_metrics(
        dataset: Arc<Array2<T>>,
        params: IndexParams,
        enable_metrics: bool,
    ) -> Result<Self> {
        Self::validate_dataset(&dataset, &params)?;

        let metrics = if enable_metrics {
            Some(Arc::new(MetricsCollector::new()))
        } else {
            None
        };

        Ok(Self {
            dataset,
            params,
            state: IndexState::Unbuilt,
            metrics,
        })
    }

    fn validate_dataset(dataset: &Array2<T>, params: &IndexParams) -> Result<()> {
        if !T::TYPE.supports_key_derivation() {
            return Err(LshError::UnsupportedElementType(T::TYPE));
        }
        if dataset.ncols() == 0 {
            return Err(LshError::InvalidConfig(
                "vector length must be greater than 0".into(),
            ));
        }
        if dataset.nrows() > FeatureIndex::MAX as usize {
            return Err(LshError::InvalidConfig(format!(
                "dataset has {} rows, at most {} can be indexed",
                dataset.nrows(),
                FeatureIndex::MAX
            )));
        }
        params.validate(dataset.ncols() * T::TYPE.size() * 8)
    }

    /// Restore a built index from its parts.
    #[cfg(feature = "persistence")]
    pub(crate) fn from_tables(
        dataset: Arc<Array2<T>>,
        params: IndexParams,
        tables: Vec<LshTable>,
    ) -> Result<Self> {
        Self::validate_dataset(&dataset, &params)?;
        let probe_masks = probe_masks(params.key_size, params.multi_probe_level);
        Ok(Self {
            dataset,
            params,
            state: IndexState::Built(BuiltTables {
                tables,
                probe_masks,
            }),
            metrics: None,
        })
    }

    // ------------------------------------------------------------------
    // Build
    // ------------------------------------------------------------------

    /// Populate every table with every dataset row.
    ///
    /// Can be called once. If it fails the index stays unbuilt.
    pub fn build_index(&mut self) -> Result<()> {
        if self.is_built() {
            return Err(LshError::AlreadyBuilt);
        }

        let watch = Stopwatch::start();
        let tables = self.build_tables().map_err(|e| {
            tracing::warn!(error = %e, "index build failed");
            e
        })?;
        let elapsed_ns = watch.elapsed_ns();

        for (i, table) in tables.iter().enumerate() {
            tracing::debug!(
                table = i,
                representation = %table.representation(),
                populated_keys = table.populated_keys(),
                arena_used_bytes = table.arena_used_memory(),
                arena_wasted_bytes = table.arena_wasted_memory(),
                "table built"
            );
        }
        tracing::info!(
            vectors = self.size(),
            tables = tables.len(),
            key_size = self.params.key_size,
            elapsed_ms = elapsed_ns as f64 / 1e6,
            "lsh index built"
        );

        if let Some(ref m) = self.metrics {
            m.record_build(BuildRecord {
                vectors: self.size() as u64,
                tables: tables.len() as u64,
                arena_bytes: tables.iter().map(|t| t.arena_used_memory() as u64).sum(),
                elapsed_ns,
            });
        }

        self.state = IndexState::Built(BuiltTables {
            tables,
            probe_masks: probe_masks(self.params.key_size, self.params.multi_probe_level),
        });
        Ok(())
    }

    fn build_tables(&self) -> Result<Vec<LshTable>> {
        let mut rng = match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // Masks are drawn in table order so a seed fixes every table.
        let feature_size = self.dataset.ncols();
        let mut tables = (0..self.params.table_number)
            .map(|_| LshTable::new::<T>(feature_size, self.params.key_size, &mut rng))
            .collect::<Result<Vec<_>>>()?;

        let rows: Vec<Cow<'_, [u8]>> = self.dataset.outer_iter().map(row_bytes).collect();
        let features: Vec<(FeatureIndex, &[u8])> = rows
            .iter()
            .enumerate()
            .map(|(i, bytes)| (i as FeatureIndex, bytes.as_ref()))
            .collect();

        insert_all(&mut tables, &features)?;
        Ok(tables)
    }

    // ------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------

    /// Find the `k` approximate nearest neighbors of one vector.
    ///
    /// Returns results sorted by ascending distance, ties by ascending index.
    /// Fewer than `k` results are returned when fewer candidates are found.
    pub fn query(&self, vector: &[T], k: usize, params: &SearchParams) -> Result<Vec<QueryResult>> {
        let built = self.built()?;
        self.check_query(vector.len(), k, params)?;

        let bytes = T::as_le_bytes(vector);
        let mut seen = DynamicBitset::new(self.size());
        Ok(self.search_bytes(built, &bytes, k, params, &mut seen))
    }

    /// Find the `k` approximate nearest neighbors of every row of `queries`.
    pub fn knn_search(
        &self,
        queries: ArrayView2<'_, T>,
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Vec<QueryResult>>> {
        let built = self.built()?;
        self.check_query(queries.ncols(), k, params)?;

        let mut seen = DynamicBitset::new(self.size());
        Ok(queries
            .outer_iter()
            .map(|query| {
                let bytes = row_bytes(query);
                self.search_bytes(built, &bytes, k, params, &mut seen)
            })
            .collect())
    }

    /// Like [`knn_search`], writing into caller-provided `indices` and
    /// `dists` (one row per query, at least `k` columns).
    ///
    /// Slots beyond the results found for a query are left untouched.
    /// Returns the number of slots filled across all queries.
    ///
    /// [`knn_search`]: LshIndex::knn_search
    pub fn knn_search_into(
        &self,
        queries: ArrayView2<'_, T>,
        mut indices: ArrayViewMut2<'_, FeatureIndex>,
        mut dists: ArrayViewMut2<'_, u32>,
        k: usize,
        params: &SearchParams,
    ) -> Result<usize> {
        for (rows, cols) in [indices.dim(), dists.dim()] {
            if rows < queries.nrows() {
                return Err(LshError::DimensionMismatch {
                    expected: queries.nrows(),
                    got: rows,
                });
            }
            if cols < k {
                return Err(LshError::DimensionMismatch {
                    expected: k,
                    got: cols,
                });
            }
        }

        let results = self.knn_search(queries, k, params)?;
        let mut filled = 0;
        for (row, neighbors) in results.iter().enumerate() {
            for (slot, n) in neighbors.iter().enumerate() {
                indices[[row, slot]] = n.index;
                dists[[row, slot]] = n.distance;
                filled += 1;
            }
        }
        Ok(filled)
    }

    fn check_query(&self, width: usize, k: usize, params: &SearchParams) -> Result<()> {
        if width != self.veclen() {
            return Err(LshError::DimensionMismatch {
                expected: self.veclen(),
                got: width,
            });
        }
        if k == 0 {
            return Err(LshError::InvalidConfig("k must be greater than 0".into()));
        }
        params.validate()
    }

    /// Gather candidates from every table, score them and keep the best `k`.
    ///
    /// `seen` must be all zero on entry and is all zero again on return.
    fn search_bytes(
        &self,
        built: &BuiltTables,
        bytes: &[u8],
        k: usize,
        params: &SearchParams,
        seen: &mut DynamicBitset,
    ) -> Vec<QueryResult> {
        let watch = self.metrics.as_ref().map(|_| Stopwatch::start());
        let budget = params.checks.unwrap_or(usize::MAX);

        let mut candidates: Vec<FeatureIndex> = Vec::new();
        let (mut hits, mut misses) = (0u64, 0u64);
        'tables: for table in &built.tables {
            let key = table.get_key(bytes);
            for &probe in &built.probe_masks {
                match table.get_bucket_from_key(key ^ probe) {
                    Some(bucket) if !bucket.is_empty() => {
                        hits += 1;
                        for &index in bucket {
                            if !seen.test(index as usize) {
                                seen.set(index as usize);
                                candidates.push(index);
                                if candidates.len() >= budget {
                                    break 'tables;
                                }
                            }
                        }
                    }
                    _ => misses += 1,
                }
            }
        }

        // Every set bit belongs to a candidate, so clearing whole words is enough.
        for &index in &candidates {
            seen.reset_block(index as usize);
        }

        let mut results: Vec<QueryResult> = candidates
            .iter()
            .map(|&index| {
                let row = row_bytes(self.dataset.row(index as usize));
                QueryResult {
                    index,
                    distance: self.params.distance.compute(bytes, &row),
                }
            })
            .collect();
        results.sort_unstable_by_key(|r| (r.distance, r.index));
        results.truncate(k);

        if let (Some(m), Some(w)) = (&self.metrics, watch) {
            m.record_query(QueryRecord {
                candidates: candidates.len() as u64,
                probes_hit: hits,
                probes_missed: misses,
                elapsed_ns: w.elapsed_ns(),
            });
        }

        results
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    fn built(&self) -> Result<&BuiltTables> {
        match &self.state {
            IndexState::Built(built) => Ok(built),
            IndexState::Unbuilt => Err(LshError::NotBuilt),
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, IndexState::Built(_))
    }

    /// The hash tables, empty while unbuilt.
    pub fn tables(&self) -> &[LshTable] {
        match &self.state {
            IndexState::Built(built) => &built.tables,
            IndexState::Unbuilt => &[],
        }
    }

    /// Number of dataset rows.
    pub fn size(&self) -> usize {
        self.dataset.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Vector length in elements.
    pub fn veclen(&self) -> usize {
        self.dataset.ncols()
    }

    pub fn element_type(&self) -> ElementType {
        T::TYPE
    }

    pub fn index_kind(&self) -> IndexKind {
        IndexKind::Lsh
    }

    pub fn distance(&self) -> DistanceMetric {
        self.params.distance
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    pub fn dataset(&self) -> &Arc<Array2<T>> {
        &self.dataset
    }

    /// Arena bytes handed out across all tables.
    pub fn used_memory(&self) -> usize {
        self.tables().iter().map(|t| t.arena_used_memory()).sum()
    }

    /// Bucket statistics for every table.
    pub fn table_stats(&self) -> Vec<LshStats> {
        self.tables().iter().map(|t| t.stats()).collect()
    }

    /// Compute aggregate statistics about the index.
    pub fn stats(&self) -> IndexStats {
        let tables = self.tables();

        let total_buckets: usize = tables.iter().map(|t| t.populated_keys()).sum();
        let total_entries: usize = tables.iter().map(|t| t.len()).sum();
        let max_bucket_size = tables
            .iter()
            .flat_map(|t| t.buckets())
            .map(|(_, b)| b.len())
            .max()
            .unwrap_or(0);

        let avg_bucket_size = if total_buckets > 0 {
            total_entries as f64 / total_buckets as f64
        } else {
            0.0
        };

        IndexStats {
            num_vectors: self.size(),
            num_tables: tables.len(),
            key_size: self.params.key_size,
            veclen: self.veclen(),
            total_buckets,
            avg_bucket_size,
            max_bucket_size,
            representations: tables.iter().map(|t| t.representation()).collect(),
            arena_used_bytes: self.used_memory(),
            arena_wasted_bytes: tables.iter().map(|t| t.arena_wasted_memory()).sum(),
            memory_estimate_bytes: tables.iter().map(|t| t.memory_estimate_bytes()).sum(),
        }
    }

    /// Snapshot of runtime metrics (`None` if metrics were not enabled).
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(|m| m.snapshot())
    }

    /// Reset the query counters.
    pub fn reset_metrics(&self) {
        if let Some(ref m) = self.metrics {
            m.reset();
        }
    }
}

#[cfg(not(feature = "parallel"))]
fn insert_all(tables: &mut [LshTable], features: &[(FeatureIndex, &[u8])]) -> Result<()> {
    for table in tables.iter_mut() {
        table.add_batch(features)?;
    }
    Ok(())
}

// Tables own their storage and arena, so each can be filled on its own thread.
#[cfg(feature = "parallel")]
fn insert_all(tables: &mut [LshTable], features: &[(FeatureIndex, &[u8])]) -> Result<()> {
    use rayon::prelude::*;

    tables
        .par_iter_mut()
        .try_for_each(|table| table.add_batch(features))
}

// ---------------------------------------------------------------------------
// Parallel batch query (behind `parallel` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "parallel")]
impl<T: Element> LshIndex<T> {
    /// Query every row of `queries` in parallel.
    pub fn par_knn_search(
        &self,
        queries: ArrayView2<'_, T>,
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Vec<QueryResult>>> {
        use rayon::prelude::*;

        let built = self.built()?;
        self.check_query(queries.ncols(), k, params)?;

        Ok((0..queries.nrows())
            .into_par_iter()
            .map_init(
                || DynamicBitset::new(self.size()),
                |seen, i| {
                    let bytes = row_bytes(queries.row(i));
                    self.search_bytes(built, &bytes, k, params, seen)
                },
            )
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder for [`LshIndex`].
pub struct LshIndexBuilder<T: Element> {
    dataset: Arc<Array2<T>>,
    params: IndexParams,
    enable_metrics: bool,
}

impl<T: Element> LshIndexBuilder<T> {
    pub fn new(dataset: Arc<Array2<T>>) -> Self {
        Self {
            dataset,
            params: IndexParams::default(),
            enable_metrics: false,
        }
    }

    pub fn table_number(mut self, n: usize) -> Self {
        self.params.table_number = n;
        self
    }

    pub fn key_size(mut self, bits: usize) -> Self {
        self.params.key_size = bits;
        self
    }

    pub fn multi_probe_level(mut self, level: usize) -> Self {
        self.params.multi_probe_level = level;
        self
    }

    pub fn distance(mut self, d: DistanceMetric) -> Self {
        self.params.distance = d;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.params.seed = Some(seed);
        self
    }

    pub fn params(mut self, params: IndexParams) -> Self {
        self.params = params;
        self
    }

    pub fn enable_metrics(mut self) -> Self {
        self.enable_metrics = true;
        self
    }

    /// Create the (unbuilt) index, returning an error on invalid configuration.
    pub fn build(self) -> Result<LshIndex<T>> {
        LshIndex::new_with_metrics(self.dataset, self.params, self.enable_metrics)
    }
}
