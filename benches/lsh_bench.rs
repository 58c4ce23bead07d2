use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hamming_lsh::distance::{hamming_lut, hamming_popcnt, hamming_popcnt32};
use hamming_lsh::{DistanceMetric, LshIndex, SearchParams};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn generate_codes(count: usize, bytes: usize, seed: u64) -> Array2<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((count, bytes), |_| rng.gen::<u8>())
}

fn brute_force_query(dataset: &Array2<u8>, query: ArrayView1<'_, u8>, k: usize) -> Vec<(usize, u32)> {
    let q = query.as_slice().unwrap_or(&[]);
    let mut dists: Vec<(usize, u32)> = dataset
        .outer_iter()
        .enumerate()
        .map(|(id, row)| (id, hamming_popcnt(row.as_slice().unwrap_or(&[]), q)))
        .collect();
    dists.sort_unstable_by_key(|&(id, d)| (d, id));
    dists.truncate(k);
    dists
}

fn build_index(data: Arc<Array2<u8>>) -> LshIndex<u8> {
    let mut index = LshIndex::builder(data)
        .table_number(12)
        .key_size(20)
        .multi_probe_level(2)
        .distance(DistanceMetric::HammingPopcnt)
        .seed(42)
        .build()
        .unwrap();
    index.build_index().unwrap();
    index
}

// ---------------------------------------------------------------------------
// Distance functors
// ---------------------------------------------------------------------------

fn bench_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("distance");

    for &bytes in &[32usize, 64, 128] {
        let codes = generate_codes(2, bytes, 7);
        let (a, b) = (codes.row(0).to_vec(), codes.row(1).to_vec());

        group.bench_with_input(BenchmarkId::new("lut", bytes), &bytes, |bench, _| {
            bench.iter(|| hamming_lut(&a, &b));
        });
        group.bench_with_input(BenchmarkId::new("popcnt64", bytes), &bytes, |bench, _| {
            bench.iter(|| hamming_popcnt(&a, &b));
        });
        group.bench_with_input(BenchmarkId::new("popcnt32", bytes), &bytes, |bench, _| {
            bench.iter(|| hamming_popcnt32(&a, &b));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Build throughput
// ---------------------------------------------------------------------------

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(10);

    for &n in &[10_000usize, 100_000] {
        let data = Arc::new(generate_codes(n, 32, 99));

        group.bench_with_input(BenchmarkId::new("bits=256", n), &n, |b, _| {
            b.iter(|| build_index(data.clone()));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Batch query (100 queries)
// ---------------------------------------------------------------------------

fn bench_batch_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_query_100");
    let k = 10;

    for &n in &[10_000usize, 100_000] {
        let data = Arc::new(generate_codes(n, 32, 99));
        let queries = generate_codes(100, 32, 5678);
        let index = build_index(data.clone());

        for (label, params) in [
            ("lsh/unlimited", SearchParams::unlimited()),
            ("lsh/checks=128", SearchParams::with_checks(128)),
        ] {
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, _| {
                b.iter(|| index.knn_search(queries.view(), k, &params).unwrap());
            });
        }

        group.bench_with_input(BenchmarkId::new("brute", n), &n, |b, _| {
            b.iter(|| {
                for q in queries.outer_iter() {
                    brute_force_query(&data, q, k);
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

criterion_group!(benches, bench_distance, bench_build, bench_batch_query);
criterion_main!(benches);
