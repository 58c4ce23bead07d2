//! Element types that can populate a dataset, and their byte views.
//!
//! Hashing and Hamming distances operate on the little-endian byte image of a
//! row. Every conversion goes through `to_le_bytes`/`from_le_bytes`, so the
//! bit positions sampled by a table are the same on every platform.

use std::borrow::Cow;
use std::fmt;

use ndarray::ArrayView1;

/// Tag identifying the element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ElementType {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    /// Whether a table can derive bucket keys from rows of this type.
    pub fn supports_key_derivation(self) -> bool {
        matches!(self, ElementType::U8 | ElementType::F32)
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fixed-width numeric type usable as a feature vector element.
pub trait Element: Copy + Send + Sync + fmt::Debug + 'static {
    const TYPE: ElementType;

    /// Append the little-endian bytes of `self` to `out`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode one element from exactly `Self::TYPE.size()` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Little-endian byte image of a whole row.
    fn as_le_bytes(row: &[Self]) -> Cow<'_, [u8]> {
        let mut out = Vec::with_capacity(row.len() * Self::TYPE.size());
        for &x in row {
            x.write_le(&mut out);
        }
        Cow::Owned(out)
    }
}

impl Element for u8 {
    const TYPE: ElementType = ElementType::U8;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }

    // Bytes are already their own little-endian image.
    fn as_le_bytes(row: &[Self]) -> Cow<'_, [u8]> {
        Cow::Borrowed(row)
    }
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const TYPE: ElementType = ElementType::$tag;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element!(
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    f32 => F32,
    f64 => F64,
);

/// Byte image of a dataset row, borrowing when the row is contiguous `u8`.
pub fn row_bytes<'a, T: Element>(row: ArrayView1<'a, T>) -> Cow<'a, [u8]> {
    match row.to_slice() {
        Some(slice) => T::as_le_bytes(slice),
        None => {
            let owned = row.to_vec();
            Cow::Owned(T::as_le_bytes(&owned).into_owned())
        }
    }
}
