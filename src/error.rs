use thiserror::Error;

use crate::element::ElementType;

/// Errors that can occur when building, querying or persisting an LSH index.
#[derive(Debug, Error)]
pub enum LshError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("key_size must be between 1 and {max}, got {key_size}")]
    InvalidKeySize { key_size: usize, max: usize },

    #[error("table_number must be greater than 0")]
    ZeroTables,

    #[error("unknown index type: {0}")]
    UnknownIndexType(String),

    #[error("unsupported index/distance combination: {index} with {distance}")]
    UnsupportedCombination { index: String, distance: String },

    #[error("LSH key derivation is not implemented for element type {0}")]
    UnsupportedElementType(ElementType),

    #[error("failed to allocate {bytes} bytes for the bucket arena")]
    Allocation { bytes: usize },

    #[error("index has not been built")]
    NotBuilt,

    #[error("index is already built")]
    AlreadyBuilt,

    #[cfg(feature = "persistence")]
    #[error("serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "persistence")]
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "persistence")]
    #[error("invalid index file, wrong signature")]
    InvalidSignature,

    #[cfg(feature = "persistence")]
    #[error("index file version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[cfg(feature = "persistence")]
    #[error("element type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: ElementType,
        found: ElementType,
    },

    #[cfg(feature = "persistence")]
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[cfg(feature = "persistence")]
    #[error("malformed dataset: {0}")]
    MalformedDataset(String),
}

impl LshError {
    /// True for errors caused by a bad input file rather than bad parameters.
    pub fn is_format_error(&self) -> bool {
        #[cfg(feature = "persistence")]
        {
            matches!(
                self,
                LshError::Serialization(_)
                    | LshError::Io(_)
                    | LshError::InvalidSignature
                    | LshError::VersionMismatch { .. }
                    | LshError::TypeMismatch { .. }
                    | LshError::DatasetNotFound(_)
                    | LshError::MalformedDataset(_)
            )
        }
        #[cfg(not(feature = "persistence"))]
        {
            false
        }
    }
}

/// A specialized Result type for LSH index operations.
pub type Result<T> = std::result::Result<T, LshError>;
