//! # hamming_lsh
//!
//! Approximate nearest-neighbor search over binary feature vectors using
//! bit-sampling Locality-Sensitive Hashing.
//!
//! Each hash table samples `key_size` random bits of a row to form a bucket
//! key. A query gathers the rows sharing its key (and, with multi-probe, the
//! keys a few bits away) in every table, then ranks those candidates by
//! Hamming distance.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use ndarray::Array2;
//! use hamming_lsh::{LshIndex, SearchParams};
//!
//! // 100 binary descriptors of 32 bytes each.
//! let data = Arc::new(Array2::from_shape_fn((100, 32), |(i, j)| (i * 31 + j * 7) as u8));
//!
//! let mut index = LshIndex::builder(data.clone())
//!     .table_number(4)
//!     .key_size(12)
//!     .seed(42)
//!     .build()
//!     .unwrap();
//! index.build_index().unwrap();
//!
//! let query = data.row(10).to_vec();
//! let results = index.query(&query, 3, &SearchParams::default()).unwrap();
//! assert_eq!(results[0].index, 10);
//! assert_eq!(results[0].distance, 0);
//! ```
//!
//! ## Feature flags
//!
//! | Flag          | Effect                                              |
//! |---------------|-----------------------------------------------------|
//! | `parallel`    | Per-table parallel build and batch query via rayon  |
//! | `persistence` | Index files and named dataset files (serde + bincode) |
//! | `full`        | Enables `parallel` + `persistence`                  |

pub mod allocator;
pub mod bitset;
pub mod dispatch;
pub mod distance;
pub mod element;
pub mod error;
pub mod hash;
pub mod index;
pub mod metrics;
pub mod table;

#[cfg(feature = "persistence")]
pub mod dataset;

#[cfg(feature = "persistence")]
pub mod persistence;

// Re-exports for convenience.
pub use dispatch::{create_index, create_index_by_name, validate_combination, DistanceKind, IndexKind};
pub use distance::DistanceMetric;
pub use element::{Element, ElementType};
pub use error::{LshError, Result};
pub use index::{IndexParams, IndexStats, LshIndex, LshIndexBuilder, QueryResult, SearchParams};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use table::{FeatureIndex, LshStats, LshTable, Representation};

#[cfg(feature = "persistence")]
pub use dataset::{list_datasets, load_dataset, save_dataset};

#[cfg(feature = "persistence")]
pub use persistence::IndexHeader;
