//! Files holding named matrices.
//!
//! One file can hold any number of datasets, each stored with its element type
//! and shape next to its little-endian bytes. Loading checks the element type
//! against the requested one instead of reinterpreting the data.
//!
//! Requires the `persistence` feature flag.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::element::{Element, ElementType};
use crate::error::{LshError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct StoredMatrix {
    element_type: ElementType,
    rows: u64,
    cols: u64,
    data: Vec<u8>,
}

type DatasetFile = BTreeMap<String, StoredMatrix>;

fn read_file(path: &Path) -> Result<DatasetFile> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes)
        .map_err(|e| LshError::MalformedDataset(format!("{}: {e}", path.display())))
}

/// Store `data` under `name`, replacing any dataset with the same name.
///
/// Other datasets already in the file are kept.
pub fn save_dataset<T: Element>(path: impl AsRef<Path>, name: &str, data: &Array2<T>) -> Result<()> {
    let path = path.as_ref();
    let mut file = if path.exists() {
        read_file(path)?
    } else {
        DatasetFile::new()
    };

    let mut bytes = Vec::with_capacity(data.len() * T::TYPE.size());
    for &x in data.iter() {
        x.write_le(&mut bytes);
    }
    file.insert(
        name.to_string(),
        StoredMatrix {
            element_type: T::TYPE,
            rows: data.nrows() as u64,
            cols: data.ncols() as u64,
            data: bytes,
        },
    );

    let encoded = bincode::serialize(&file).map_err(|e| LshError::Serialization(e.to_string()))?;
    fs::write(path, encoded)?;
    tracing::debug!(
        path = %path.display(),
        name,
        rows = data.nrows(),
        cols = data.ncols(),
        "dataset saved"
    );
    Ok(())
}

/// Load the dataset stored under `name`.
pub fn load_dataset<T: Element>(path: impl AsRef<Path>, name: &str) -> Result<Array2<T>> {
    let path = path.as_ref();
    let mut file = read_file(path)?;
    let stored = file
        .remove(name)
        .ok_or_else(|| LshError::DatasetNotFound(name.to_string()))?;

    if stored.element_type != T::TYPE {
        return Err(LshError::TypeMismatch {
            expected: T::TYPE,
            found: stored.element_type,
        });
    }

    let malformed = |msg: String| LshError::MalformedDataset(format!("{name}: {msg}"));
    let rows = usize::try_from(stored.rows).map_err(|e| malformed(e.to_string()))?;
    let cols = usize::try_from(stored.cols).map_err(|e| malformed(e.to_string()))?;
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(T::TYPE.size()))
        .ok_or_else(|| malformed(format!("{rows}x{cols} overflows")))?;
    if stored.data.len() != expected {
        return Err(malformed(format!(
            "{rows}x{cols} {} needs {expected} bytes, found {}",
            T::TYPE,
            stored.data.len()
        )));
    }

    let values: Vec<T> = stored
        .data
        .chunks_exact(T::TYPE.size())
        .map(T::read_le)
        .collect();
    Array2::from_shape_vec((rows, cols), values).map_err(|e| malformed(e.to_string()))
}

/// Names of the datasets stored in a file, in sorted order.
pub fn list_datasets(path: impl AsRef<Path>) -> Result<Vec<String>> {
    Ok(read_file(path.as_ref())?.into_keys().collect())
}
