//! Index/distance selection.
//!
//! Which distances an index type accepts is a data table checked before any
//! index is constructed, so an invalid pairing is reported as a configuration
//! error instead of failing somewhere inside the build.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::Array2;

use crate::distance::DistanceMetric;
use crate::element::Element;
use crate::error::{LshError, Result};
use crate::index::{IndexParams, LshIndex};

/// Index algorithms this crate can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum IndexKind {
    Lsh,
}

impl IndexKind {
    /// Numeric algorithm tag, as written in index headers.
    pub fn tag(self) -> u32 {
        match self {
            IndexKind::Lsh => 6,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            6 => Ok(IndexKind::Lsh),
            other => Err(LshError::UnknownIndexType(other.to_string())),
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Lsh => f.write_str("lsh"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = LshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lsh" => Ok(IndexKind::Lsh),
            other => Err(LshError::UnknownIndexType(other.to_string())),
        }
    }
}

/// Distance functions a caller can ask for.
///
/// Only the Hamming family has an implementation here; the vector-space
/// distances exist so that requesting them produces a clear error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum DistanceKind {
    HammingLut,
    HammingPopcnt,
    Hamming32,
    L2,
    L1,
}

impl DistanceKind {
    /// The functor implementing this distance, if it compares bits.
    pub fn metric(self) -> Option<DistanceMetric> {
        match self {
            DistanceKind::HammingLut => Some(DistanceMetric::HammingLut),
            DistanceKind::HammingPopcnt => Some(DistanceMetric::HammingPopcnt),
            DistanceKind::Hamming32 => Some(DistanceMetric::Hamming32),
            DistanceKind::L2 | DistanceKind::L1 => None,
        }
    }
}

impl From<DistanceMetric> for DistanceKind {
    fn from(metric: DistanceMetric) -> Self {
        match metric {
            DistanceMetric::HammingLut => DistanceKind::HammingLut,
            DistanceMetric::HammingPopcnt => DistanceKind::HammingPopcnt,
            DistanceMetric::Hamming32 => DistanceKind::Hamming32,
        }
    }
}

impl fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistanceKind::HammingLut => "hamming_lut",
            DistanceKind::HammingPopcnt => "hamming",
            DistanceKind::Hamming32 => "hamming32",
            DistanceKind::L2 => "l2",
            DistanceKind::L1 => "l1",
        })
    }
}

impl FromStr for DistanceKind {
    type Err = LshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hamming_lut" => Ok(DistanceKind::HammingLut),
            "hamming" | "hamming_popcnt" => Ok(DistanceKind::HammingPopcnt),
            "hamming32" => Ok(DistanceKind::Hamming32),
            "l2" | "euclidean" => Ok(DistanceKind::L2),
            "l1" | "manhattan" => Ok(DistanceKind::L1),
            other => Err(LshError::InvalidConfig(format!("unknown distance: {other}"))),
        }
    }
}

/// Every index/distance pairing that can be constructed.
const COMPATIBLE: &[(IndexKind, DistanceKind)] = &[
    (IndexKind::Lsh, DistanceKind::HammingLut),
    (IndexKind::Lsh, DistanceKind::HammingPopcnt),
    (IndexKind::Lsh, DistanceKind::Hamming32),
];

/// Check that `distance` can be used with `index`, returning its functor.
pub fn validate_combination(index: IndexKind, distance: DistanceKind) -> Result<DistanceMetric> {
    let unsupported = || LshError::UnsupportedCombination {
        index: index.to_string(),
        distance: distance.to_string(),
    };
    if !COMPATIBLE.contains(&(index, distance)) {
        return Err(unsupported());
    }
    distance.metric().ok_or_else(unsupported)
}

/// Create an unbuilt index of the requested kind.
///
/// `params.distance` is overridden by `distance` once the pairing is validated.
pub fn create_index<T: Element>(
    index: IndexKind,
    distance: DistanceKind,
    dataset: Arc<Array2<T>>,
    mut params: IndexParams,
) -> Result<LshIndex<T>> {
    params.distance = validate_combination(index, distance)?;
    match index {
        IndexKind::Lsh => LshIndex::new(dataset, params),
    }
}

/// Like [`create_index`], with the algorithm and distance given by name.
pub fn create_index_by_name<T: Element>(
    index: &str,
    distance: &str,
    dataset: Arc<Array2<T>>,
    params: IndexParams,
) -> Result<LshIndex<T>> {
    create_index(index.parse()?, distance.parse()?, dataset, params)
}
