use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Outcome of one build, as reported to [`MetricsCollector::record_build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildRecord {
    pub vectors: u64,
    pub tables: u64,
    /// Arena bytes handed out across all tables.
    pub arena_bytes: u64,
    pub elapsed_ns: u64,
}

/// Outcome of one query, as reported to [`MetricsCollector::record_query`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryRecord {
    /// Distinct rows scored.
    pub candidates: u64,
    /// Probed keys that held at least one row.
    pub probes_hit: u64,
    /// Probed keys that held nothing.
    pub probes_missed: u64,
    pub elapsed_ns: u64,
}

/// Build and query statistics, kept in lock-free atomic counters so queries
/// on a shared index can report concurrently.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    indexed_vectors: AtomicU64,
    build_tables: AtomicU64,
    build_arena_bytes: AtomicU64,
    build_time_ns: AtomicU64,

    query_count: AtomicU64,
    candidates: AtomicU64,
    max_candidates: AtomicU64,
    query_time_ns: AtomicU64,
    probes_hit: AtomicU64,
    probes_missed: AtomicU64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the build figures. An index is built once.
    pub fn record_build(&self, build: BuildRecord) {
        self.indexed_vectors.store(build.vectors, Ordering::Relaxed);
        self.build_tables.store(build.tables, Ordering::Relaxed);
        self.build_arena_bytes
            .store(build.arena_bytes, Ordering::Relaxed);
        self.build_time_ns.store(build.elapsed_ns, Ordering::Relaxed);
    }

    pub fn record_query(&self, query: QueryRecord) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.candidates.fetch_add(query.candidates, Ordering::Relaxed);
        self.max_candidates
            .fetch_max(query.candidates, Ordering::Relaxed);
        self.query_time_ns
            .fetch_add(query.elapsed_ns, Ordering::Relaxed);
        self.probes_hit.fetch_add(query.probes_hit, Ordering::Relaxed);
        self.probes_missed
            .fetch_add(query.probes_missed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let queries = load(&self.query_count);
        let hits = load(&self.probes_hit);

        MetricsSnapshot {
            indexed_vectors: load(&self.indexed_vectors),
            build_tables: load(&self.build_tables),
            build_arena_bytes: load(&self.build_arena_bytes),
            build_time_ms: load(&self.build_time_ns) as f64 / 1e6,
            query_count: queries,
            avg_query_time_us: ratio(load(&self.query_time_ns), queries) / 1000.0,
            avg_candidates_per_query: ratio(load(&self.candidates), queries),
            max_candidates_per_query: load(&self.max_candidates),
            bucket_hit_rate: ratio(hits, hits + load(&self.probes_missed)),
        }
    }

    /// Zero the query counters. Build figures describe the index and are kept.
    pub fn reset(&self) {
        for counter in [
            &self.query_count,
            &self.candidates,
            &self.max_candidates,
            &self.query_time_ns,
            &self.probes_hit,
            &self.probes_missed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time copy of the collected figures.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub indexed_vectors: u64,
    pub build_tables: u64,
    pub build_arena_bytes: u64,
    pub build_time_ms: f64,
    pub query_count: u64,
    pub avg_query_time_us: f64,
    pub avg_candidates_per_query: f64,
    pub max_candidates_per_query: u64,
    /// Fraction of probed keys that held at least one row.
    pub bucket_hit_rate: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Build: {} vectors x {} tables in {:.1}ms ({:.1}KB arena) | \
             Queries: {}, avg {:.2}us, candidates avg {:.1} / max {}, probe hit rate {:.1}%",
            self.indexed_vectors,
            self.build_tables,
            self.build_time_ms,
            self.build_arena_bytes as f64 / 1024.0,
            self.query_count,
            self.avg_query_time_us,
            self.avg_candidates_per_query,
            self.max_candidates_per_query,
            self.bucket_hit_rate * 100.0,
        )
    }
}

/// Wall-clock timer for build and query durations.
pub(crate) struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.0.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(candidates: u64, hit: u64, missed: u64, ns: u64) -> QueryRecord {
        QueryRecord {
            candidates,
            probes_hit: hit,
            probes_missed: missed,
            elapsed_ns: ns,
        }
    }

    #[test]
    fn test_snapshot_averages() {
        let m = MetricsCollector::new();
        m.record_build(BuildRecord {
            vectors: 1000,
            tables: 4,
            arena_bytes: 2048,
            elapsed_ns: 5_000_000,
        });
        m.record_query(query(10, 2, 1, 2_000));
        m.record_query(query(30, 1, 0, 4_000));

        let s = m.snapshot();
        assert_eq!(s.query_count, 2);
        assert_eq!(s.indexed_vectors, 1000);
        assert_eq!(s.build_tables, 4);
        assert!((s.build_time_ms - 5.0).abs() < 1e-9);
        assert!((s.avg_candidates_per_query - 20.0).abs() < 1e-9);
        assert_eq!(s.max_candidates_per_query, 30);
        assert!((s.avg_query_time_us - 3.0).abs() < 1e-9);
        assert!((s.bucket_hit_rate - 0.75).abs() < 1e-9);
        assert!(s.to_string().contains("1000 vectors x 4 tables"));
    }

    #[test]
    fn test_empty_snapshot_has_no_nans() {
        let s = MetricsCollector::new().snapshot();
        assert_eq!(s.avg_query_time_us, 0.0);
        assert_eq!(s.avg_candidates_per_query, 0.0);
        assert_eq!(s.bucket_hit_rate, 0.0);
    }

    #[test]
    fn test_reset_keeps_build_figures() {
        let m = MetricsCollector::new();
        m.record_build(BuildRecord {
            vectors: 10,
            ..BuildRecord::default()
        });
        m.record_query(query(5, 1, 1, 5));
        m.reset();
        let s = m.snapshot();
        assert_eq!(s.query_count, 0);
        assert_eq!(s.max_candidates_per_query, 0);
        assert_eq!(s.indexed_vectors, 10);
    }
}
