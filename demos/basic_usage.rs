//! Basic usage of `hamming_lsh`.
//!
//! Demonstrates the builder pattern, building over random binary codes,
//! querying, multi-probe and check budgets, inspecting stats and metrics, and
//! saving the index to disk.
//!
//! Run with:
//!   cargo run --example basic_usage

use std::sync::Arc;

use hamming_lsh::*;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CODE_BYTES: usize = 32;
const NUM_VECTORS: usize = 10_000;

fn main() {
    // ---------------------------------------------------------------
    // 1. Generate 10,000 random 256-bit codes.
    // ---------------------------------------------------------------
    println!("=== Step 1: Generate {NUM_VECTORS} random {}-bit codes ===", CODE_BYTES * 8);
    let mut rng = StdRng::seed_from_u64(123);
    let data = Arc::new(Array2::from_shape_fn((NUM_VECTORS, CODE_BYTES), |_| {
        rng.gen::<u8>()
    }));
    println!("Dataset shape: {:?}\n", data.dim());

    // ---------------------------------------------------------------
    // 2. Configure and build an LSH index using the builder pattern.
    // ---------------------------------------------------------------
    println!("=== Step 2: Build the index ===");
    let mut index = LshIndex::builder(data.clone())
        .table_number(8)
        .key_size(16)
        .multi_probe_level(2)
        .distance(DistanceMetric::HammingPopcnt)
        .seed(42)
        .enable_metrics()
        .build()
        .expect("invalid configuration");
    index.build_index().expect("build failed");
    println!("{}\n", index.stats());

    // ---------------------------------------------------------------
    // 3. Query with one of the indexed codes; print top-5 results.
    // ---------------------------------------------------------------
    println!("=== Step 3: Query top-5 nearest neighbors for row #0 ===");
    let query = data.row(0).to_vec();
    let results = index
        .query(&query, 5, &SearchParams::default())
        .expect("query failed");
    for (rank, r) in results.iter().enumerate() {
        println!("  #{}: row={:<6} distance={}", rank + 1, r.index, r.distance);
    }
    println!();

    // ---------------------------------------------------------------
    // 4. Perturb a code and search with a bounded candidate budget.
    // ---------------------------------------------------------------
    println!("=== Step 4: Search for a perturbed copy of row #77 ===");
    let mut noisy = data.row(77).to_vec();
    for _ in 0..4 {
        let bit = rng.gen_range(0..CODE_BYTES * 8);
        noisy[bit / 8] ^= 1 << (bit % 8);
    }
    for params in [SearchParams::unlimited(), SearchParams::with_checks(50)] {
        let results = index.query(&noisy, 3, &params).expect("query failed");
        let top: Vec<String> = results
            .iter()
            .map(|r| format!("{}@{}", r.index, r.distance))
            .collect();
        println!("  checks={:?}: {}", params.checks, top.join(", "));
    }
    println!();

    // ---------------------------------------------------------------
    // 5. Per-table bucket statistics.
    // ---------------------------------------------------------------
    println!("=== Step 5: Table 0 statistics ===");
    if let Some(stats) = index.table_stats().first() {
        println!("{stats}\n");
    }

    // ---------------------------------------------------------------
    // 6. Runtime metrics.
    // ---------------------------------------------------------------
    println!("=== Step 6: Metrics ===");
    if let Some(m) = index.metrics() {
        println!("{m}\n");
    }

    // ---------------------------------------------------------------
    // 7. Save and reload.
    // ---------------------------------------------------------------
    println!("=== Step 7: Save and reload ===");
    let path = std::env::temp_dir().join("hamming_lsh_basic_usage.idx");
    index.save_to_path(&path).expect("save failed");
    let loaded = LshIndex::load_from_path(&path, data.clone()).expect("load failed");
    let reloaded = loaded
        .query(&query, 1, &SearchParams::default())
        .expect("query failed");
    println!(
        "Reloaded index from {} and found row {} again.",
        path.display(),
        reloaded[0].index
    );
    let _ = std::fs::remove_file(&path);
}
