//! Save and load a built index to/from disk.
//!
//! A file is a fixed-layout [`IndexHeader`] followed by the index body (the
//! construction parameters and every table), both encoded with bincode. The
//! dataset itself is not stored: the caller supplies it again on load and the
//! header is checked against it.
//!
//! Requires the `persistence` feature flag.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::dispatch::{DistanceKind, IndexKind};
use crate::element::{Element, ElementType};
use crate::error::{LshError, Result};
use crate::index::{IndexParams, LshIndex};
use crate::table::LshTable;

/// Magic bytes at the start of every index file.
pub const SIGNATURE: &str = "HAMMING_LSH";

/// Version written into new files; loading requires an exact match.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn fixed16(s: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = s.len().min(16);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

fn unpad(bytes: &[u8; 16]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn bincode_error(e: bincode::Error) -> LshError {
    match *e {
        bincode::ErrorKind::Io(io) => LshError::Io(io),
        other => LshError::Serialization(other.to_string()),
    }
}

/// Fixed-layout header describing a saved index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub signature: [u8; 16],
    pub version: [u8; 16],
    pub element_type: ElementType,
    pub index_kind: IndexKind,
    pub distance: DistanceKind,
    pub rows: u64,
    pub cols: u64,
}

impl IndexHeader {
    /// Header describing `index` as written by this version of the crate.
    pub fn for_index<T: Element>(index: &LshIndex<T>) -> Self {
        Self {
            signature: fixed16(SIGNATURE),
            version: fixed16(VERSION),
            element_type: index.element_type(),
            index_kind: index.index_kind(),
            distance: index.distance().into(),
            rows: index.size() as u64,
            cols: index.veclen() as u64,
        }
    }

    pub fn signature(&self) -> String {
        unpad(&self.signature)
    }

    pub fn version(&self) -> String {
        unpad(&self.version)
    }

    /// Read only the header of a saved index.
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        bincode::deserialize_from(reader).map_err(|e| match *e {
            bincode::ErrorKind::Io(io) if io.kind() != std::io::ErrorKind::UnexpectedEof => {
                LshError::Io(io)
            }
            _ => LshError::InvalidSignature,
        })
    }

    /// Check that a file with this header can be loaded over `dataset`.
    pub fn validate<T: Element>(&self, dataset: &Array2<T>) -> Result<()> {
        if self.signature != fixed16(SIGNATURE) {
            return Err(LshError::InvalidSignature);
        }
        if self.version != fixed16(VERSION) {
            return Err(LshError::VersionMismatch {
                expected: VERSION.to_string(),
                found: self.version(),
            });
        }
        if self.element_type != T::TYPE {
            return Err(LshError::TypeMismatch {
                expected: T::TYPE,
                found: self.element_type,
            });
        }
        if self.rows != dataset.nrows() as u64 {
            return Err(LshError::DimensionMismatch {
                expected: dataset.nrows(),
                got: self.rows as usize,
            });
        }
        if self.cols != dataset.ncols() as u64 {
            return Err(LshError::DimensionMismatch {
                expected: dataset.ncols(),
                got: self.cols as usize,
            });
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct IndexBodyRef<'a> {
    params: &'a IndexParams,
    tables: &'a [LshTable],
}

#[derive(Deserialize)]
struct IndexBody {
    params: IndexParams,
    tables: Vec<LshTable>,
}

impl<T: Element> LshIndex<T> {
    /// Write the header and the built tables to `writer`.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        if !self.is_built() {
            return Err(LshError::NotBuilt);
        }
        let header = IndexHeader::for_index(self);
        bincode::serialize_into(&mut writer, &header).map_err(bincode_error)?;
        let body = IndexBodyRef {
            params: self.params(),
            tables: self.tables(),
        };
        bincode::serialize_into(&mut writer, &body).map_err(bincode_error)?;
        writer.flush()?;
        Ok(())
    }

    /// Restore a built index over `dataset` from `reader`.
    pub fn load<R: Read>(mut reader: R, dataset: Arc<Array2<T>>) -> Result<Self> {
        let header = IndexHeader::read_from(&mut reader).map_err(|e| {
            tracing::warn!(error = %e, "rejected index file");
            e
        })?;
        if let Err(e) = header.validate(&dataset) {
            tracing::warn!(error = %e, "rejected index file");
            return Err(e);
        }

        let body: IndexBody = bincode::deserialize_from(&mut reader).map_err(bincode_error)?;
        if DistanceKind::from(body.params.distance) != header.distance {
            return Err(LshError::Serialization(format!(
                "header distance {} does not match stored parameters ({})",
                header.distance,
                DistanceKind::from(body.params.distance)
            )));
        }
        if body.tables.len() != body.params.table_number {
            return Err(LshError::Serialization(format!(
                "expected {} tables, found {}",
                body.params.table_number,
                body.tables.len()
            )));
        }
        let feature_bytes = dataset.ncols() * T::TYPE.size();
        if let Some(table) = body.tables.iter().find(|t| t.feature_bytes() != feature_bytes) {
            return Err(LshError::DimensionMismatch {
                expected: feature_bytes,
                got: table.feature_bytes(),
            });
        }
        body.params
            .validate(feature_bytes * 8)
            .map_err(|e| LshError::Serialization(format!("stored parameters: {e}")))?;
        for (i, table) in body.tables.iter().enumerate() {
            if let Err(e) = table.validate(dataset.nrows(), body.params.key_size, feature_bytes) {
                tracing::warn!(table = i, error = %e, "rejected index file");
                return Err(e);
            }
        }

        tracing::debug!(
            rows = header.rows,
            tables = body.tables.len(),
            "index loaded"
        );
        LshIndex::from_tables(dataset, body.params, body.tables)
    }

    /// Save the index to a file, replacing it if it exists.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        self.save(BufWriter::new(file))
    }

    /// Load an index saved with [`save_to_path`](LshIndex::save_to_path).
    pub fn load_from_path(path: impl AsRef<Path>, dataset: Arc<Array2<T>>) -> Result<Self> {
        let file = File::open(path)?;
        Self::load(BufReader::new(file), dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BitMask;
    use crate::index::SearchParams;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn built_index() -> (Arc<Array2<u8>>, LshIndex<u8>) {
        let mut rng = StdRng::seed_from_u64(11);
        let data = Arc::new(Array2::from_shape_fn((200, 16), |_| rng.gen::<u8>()));
        let mut index = LshIndex::builder(data.clone())
            .table_number(3)
            .key_size(10)
            .multi_probe_level(1)
            .seed(5)
            .build()
            .unwrap();
        index.build_index().unwrap();
        (data, index)
    }

    #[test]
    fn test_round_trip_in_memory() {
        let (data, index) = built_index();
        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();

        let loaded = LshIndex::load(buf.as_slice(), data.clone()).unwrap();
        assert!(loaded.is_built());
        assert_eq!(loaded.params(), index.params());

        let params = SearchParams::default();
        for row in [0usize, 42, 199] {
            let q = data.row(row).to_vec();
            assert_eq!(
                loaded.query(&q, 5, &params).unwrap(),
                index.query(&q, 5, &params).unwrap()
            );
        }
    }

    #[test]
    fn test_unbuilt_index_is_not_saved() {
        let data = Arc::new(Array2::<u8>::zeros((4, 4)));
        let index = LshIndex::new(data, IndexParams::default()).unwrap();
        assert!(matches!(index.save(Vec::new()), Err(LshError::NotBuilt)));
    }

    #[test]
    fn test_corrupt_signature() {
        let (data, index) = built_index();
        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();
        buf[0] = b'X';
        let err = LshIndex::load(buf.as_slice(), data).unwrap_err();
        assert!(matches!(err, LshError::InvalidSignature), "expected InvalidSignature, got: {err:?}");
        assert!(err.is_format_error());
    }

    #[test]
    fn test_truncated_file() {
        let (data, _) = built_index();
        let err = LshIndex::load(&b"HAMM"[..], data).unwrap_err();
        assert!(matches!(err, LshError::InvalidSignature), "got: {err:?}");
    }

    #[test]
    fn test_version_mismatch() {
        let (data, index) = built_index();
        let mut header = IndexHeader::for_index(&index);
        header.version = fixed16("0.0.0-old");
        let err = header.validate(&data).unwrap_err();
        assert!(
            matches!(err, LshError::VersionMismatch { ref found, .. } if found == "0.0.0-old"),
            "got: {err:?}"
        );
    }

    #[test]
    fn test_element_type_mismatch() {
        let (_, index) = built_index();
        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();
        let floats = Arc::new(Array2::<f32>::zeros((200, 4)));
        let err = LshIndex::load(buf.as_slice(), floats).unwrap_err();
        assert!(matches!(
            err,
            LshError::TypeMismatch {
                expected: ElementType::F32,
                found: ElementType::U8
            }
        ));
    }

    #[test]
    fn test_dataset_shape_mismatch() {
        let (_, index) = built_index();
        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();
        let smaller = Arc::new(Array2::<u8>::zeros((100, 16)));
        let err = LshIndex::load(buf.as_slice(), smaller).unwrap_err();
        assert!(matches!(err, LshError::DimensionMismatch { expected: 100, got: 200 }));
    }

    /// Serialize `tables` behind a header that matches `index`.
    fn write_with_tables(index: &LshIndex<u8>, params: &IndexParams, tables: &[LshTable]) -> Vec<u8> {
        let mut buf = Vec::new();
        bincode::serialize_into(&mut buf, &IndexHeader::for_index(index)).unwrap();
        bincode::serialize_into(&mut buf, &IndexBodyRef { params, tables }).unwrap();
        buf
    }

    #[test]
    fn test_row_past_dataset_is_rejected() {
        let (data, index) = built_index();
        let params = IndexParams {
            table_number: 1,
            ..index.params().clone()
        };
        let bits: Vec<usize> = (0..params.key_size).collect();
        let mut table = LshTable::with_mask(BitMask::from_bits(16, &bits), 16);
        table.add(5000, data.row(3).as_slice().unwrap()).unwrap();

        let buf = write_with_tables(&index, &params, std::slice::from_ref(&table));
        let err = LshIndex::load(buf.as_slice(), data).unwrap_err();
        assert!(matches!(err, LshError::Serialization(_)), "got: {err:?}");
        assert!(err.is_format_error());
    }

    #[test]
    fn test_key_size_disagreeing_with_params_is_rejected() {
        let (data, index) = built_index();
        let params = IndexParams {
            table_number: 1,
            ..index.params().clone()
        };
        let table = LshTable::with_mask(BitMask::from_bits(16, &[0, 1, 2]), 16);

        let buf = write_with_tables(&index, &params, std::slice::from_ref(&table));
        let err = LshIndex::load(buf.as_slice(), data).unwrap_err();
        assert!(matches!(err, LshError::Serialization(_)), "got: {err:?}");
    }

    #[test]
    fn test_header_strings() {
        let (_, index) = built_index();
        let header = IndexHeader::for_index(&index);
        assert_eq!(header.signature(), SIGNATURE);
        assert_eq!(header.version(), VERSION);
        assert_eq!(header.index_kind, IndexKind::Lsh);
        assert_eq!(header.distance, DistanceKind::HammingPopcnt);
    }
}
