use hamming_lsh::*;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn random_codes(rng: &mut StdRng, rows: usize, bytes: usize) -> Array2<u8> {
    Array2::from_shape_fn((rows, bytes), |_| rng.gen::<u8>())
}

/// `centers` random codes, each followed by `per_center - 1` copies with a
/// few bits flipped.
fn clustered_codes(rng: &mut StdRng, centers: usize, per_center: usize, bytes: usize) -> Array2<u8> {
    let mut data = Array2::<u8>::zeros((centers * per_center, bytes));
    for c in 0..centers {
        let center: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
        for j in 0..per_center {
            let mut row = center.clone();
            if j > 0 {
                for _ in 0..3 {
                    let bit = rng.gen_range(0..bytes * 8);
                    row[bit / 8] ^= 1 << (bit % 8);
                }
            }
            data.row_mut(c * per_center + j)
                .assign(&ndarray::ArrayView1::from(row.as_slice()));
        }
    }
    data
}

fn make_index(data: Arc<Array2<u8>>, seed: u64) -> LshIndex<u8> {
    let mut index = LshIndex::builder(data)
        .table_number(8)
        .key_size(16)
        .multi_probe_level(2)
        .seed(seed)
        .enable_metrics()
        .build()
        .unwrap();
    index.build_index().unwrap();
    index
}

// ---------------------------------------------------------------------------
// 1. Concurrent queries against a shared index
//    Spawn 8 reader threads over one Arc<LshIndex>; every thread checks
//    its results against a single-threaded reference run.
// ---------------------------------------------------------------------------

#[test]
fn stress_concurrent_queries() {
    let mut rng = StdRng::seed_from_u64(42);
    let data = Arc::new(random_codes(&mut rng, 10_000, 32));
    let index = Arc::new(make_index(data, 1));
    let num_threads = 8;
    let queries_per_thread = 200;

    let mut handles = Vec::new();
    for t in 0..num_threads {
        let idx = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(100 + t as u64);
            let queries = random_codes(&mut rng, queries_per_thread, 32);
            let results = idx
                .knn_search(queries.view(), 10, &SearchParams::default())
                .unwrap();
            (queries, results)
        }));
    }

    for h in handles {
        let (queries, results) = h.join().expect("reader thread panicked");
        let reference = index
            .knn_search(queries.view(), 10, &SearchParams::default())
            .unwrap();
        assert_eq!(results, reference, "concurrent results differ from reference");
    }

    let m = index.metrics().unwrap();
    assert_eq!(
        m.query_count,
        2 * (num_threads * queries_per_thread) as u64,
        "every query should be counted exactly once"
    );
}

// ---------------------------------------------------------------------------
// 2. Large-scale build
// ---------------------------------------------------------------------------

#[test]
fn stress_large_scale_build() {
    let mut rng = StdRng::seed_from_u64(7);
    let n = 50_000;
    let data = Arc::new(random_codes(&mut rng, n, 16));
    let index = make_index(data.clone(), 2);

    assert_eq!(index.size(), n);
    for table in index.tables() {
        assert_eq!(table.len(), n, "every row must land in every table");
        let stored: usize = table.buckets().map(|(_, b)| b.len()).sum();
        assert_eq!(stored, n);
    }

    // A handful of self-queries must succeed.
    for row in [0, 1, n / 2, n - 1] {
        let q = data.row(row).to_vec();
        let results = index.query(&q, 1, &SearchParams::default()).unwrap();
        assert_eq!(results[0].distance, 0);
    }
}

// ---------------------------------------------------------------------------
// 3. Every row appears exactly once per table
// ---------------------------------------------------------------------------

#[test]
fn stress_bucket_entries_are_a_partition() {
    let mut rng = StdRng::seed_from_u64(19);
    let n = 5_000;
    let data = Arc::new(random_codes(&mut rng, n, 8));
    let index = make_index(data, 3);

    for table in index.tables() {
        let mut seen = HashSet::with_capacity(n);
        for (key, bucket) in table.buckets() {
            assert!(key < 1 << table.key_size());
            for &i in bucket {
                assert!((i as usize) < n, "bucket entry {i} out of range");
                assert!(seen.insert(i), "row {i} stored twice");
            }
        }
        assert_eq!(seen.len(), n);
    }
}

// ---------------------------------------------------------------------------
// 4. Clustered data: near duplicates are found
// ---------------------------------------------------------------------------

#[test]
fn stress_clustered_recall() {
    let mut rng = StdRng::seed_from_u64(2);
    let per_center = 5;
    let data = Arc::new(clustered_codes(&mut rng, 400, per_center, 32));
    let index = make_index(data.clone(), 5);

    let mut found = 0usize;
    let mut total = 0usize;
    for c in 0..400 {
        let center = c * per_center;
        let q = data.row(center).to_vec();
        let results = index.query(&q, per_center, &SearchParams::default()).unwrap();
        let ids: HashSet<u32> = results.iter().map(|r| r.index).collect();
        for j in 0..per_center {
            total += 1;
            if ids.contains(&((center + j) as u32)) {
                found += 1;
            }
        }
    }

    let recall = found as f64 / total as f64;
    assert!(recall > 0.9, "recall on 3-bit perturbations too low: {recall:.3}");
}

// ---------------------------------------------------------------------------
// 5. Bounded checks under load
// ---------------------------------------------------------------------------

#[test]
fn stress_checks_bound_holds_for_every_query() {
    let mut rng = StdRng::seed_from_u64(23);
    let data = Arc::new(random_codes(&mut rng, 20_000, 4));
    let mut index = LshIndex::builder(data)
        .table_number(6)
        .key_size(6)
        .multi_probe_level(2)
        .seed(4)
        .enable_metrics()
        .build()
        .unwrap();
    index.build_index().unwrap();

    let queries = random_codes(&mut rng, 100, 4);
    let results = index
        .knn_search(queries.view(), 1_000, &SearchParams::with_checks(64))
        .unwrap();
    for r in &results {
        assert!(r.len() <= 64);
    }
    let m = index.metrics().unwrap();
    assert!(m.avg_candidates_per_query <= 64.0);
}

// ---------------------------------------------------------------------------
// 6. Parallel batch query (behind `parallel` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "parallel")]
#[test]
fn stress_par_knn_search_matches_sequential() {
    let mut rng = StdRng::seed_from_u64(64);
    let data = Arc::new(random_codes(&mut rng, 20_000, 16));
    let index = make_index(data, 9);

    let queries = random_codes(&mut rng, 500, 16);
    let params = SearchParams::default();
    let sequential = index.knn_search(queries.view(), 10, &params).unwrap();
    let parallel = index.par_knn_search(queries.view(), 10, &params).unwrap();
    assert_eq!(sequential, parallel);
}
