//! Named tensors
//!
//! The unit of exchange across the request/response boundary: a named, typed,
//! shaped flat buffer. Shapes are row-major and every dimension is positive.
//! The first dimension is the batch (row) dimension wherever rows matter.

use crate::error::BackendError;
use half::f16;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use strum::{Display, EnumString};

/// Mapping from tensor name to tensor. Names are unique by construction.
pub type TensorMap = BTreeMap<String, NamedTensor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    Int32,
    Int64,
    Float32,
    Float16,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 => 8,
            DType::Float16 => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float16(Vec<f16>),
}

// Apply the same expression to whichever vector is inside, rewrapping in the same variant.
macro_rules! map_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::Int32($v) => TensorData::Int32($body),
            TensorData::Int64($v) => TensorData::Int64($body),
            TensorData::Float32($v) => TensorData::Float32($body),
            TensorData::Float16($v) => TensorData::Float16($body),
        }
    };
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Int32(_) => DType::Int32,
            TensorData::Int64(_) => DType::Int64,
            TensorData::Float32(_) => DType::Float32,
            TensorData::Float16(_) => DType::Float16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Float32(v) => v.len(),
            TensorData::Float16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if every floating point element is finite. Integer data is always finite.
    pub fn is_finite(&self) -> bool {
        match self {
            TensorData::Float32(v) => v.iter().all(|x| x.is_finite()),
            TensorData::Float16(v) => v.iter().all(|x| x.is_finite()),
            TensorData::Int32(_) | TensorData::Int64(_) => true,
        }
    }

    fn slice(&self, range: Range<usize>) -> TensorData {
        map_data!(self, v => v[range.clone()].to_vec())
    }

    /// Little-endian bytes, the layout used by safetensors.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Int64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Float32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Float16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<Self, String> {
        let size = dtype.size_in_bytes();
        if bytes.len() % size != 0 {
            return Err(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype
            ));
        }
        let chunks = bytes.chunks_exact(size);
        let data = match dtype {
            DType::Int32 => TensorData::Int32(
                chunks
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Int64 => TensorData::Int64(
                chunks
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::Float32 => TensorData::Float32(
                chunks
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Float16 => TensorData::Float16(
                chunks.map(|c| f16::from_le_bytes([c[0], c[1]])).collect(),
            ),
        };
        Ok(data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    name: String,
    shape: Vec<usize>,
    data: TensorData,
}

impl NamedTensor {
    /// Build a tensor, checking the name is non-empty, every dimension is positive
    /// and the buffer holds exactly `product(shape)` elements.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        data: TensorData,
    ) -> Result<Self, BackendError> {
        let name = name.into();
        if name.is_empty() {
            return Err(BackendError::invalid_input("name", "tensor name is empty"));
        }
        if shape.is_empty() {
            return Err(BackendError::invalid_input(name, "tensor has no dimensions"));
        }
        if shape.contains(&0) {
            return Err(BackendError::invalid_input(
                name,
                format!("shape {shape:?} has a zero-length dimension"),
            ));
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(BackendError::invalid_input(
                name,
                format!(
                    "shape {:?} needs {} {} elements, buffer holds {}",
                    shape,
                    expected,
                    data.dtype(),
                    data.len()
                ),
            ));
        }
        Ok(Self { name, shape, data })
    }

    /// Encode protein sequences as an `int32` tensor of shape `[batch, width]`.
    ///
    /// Row `i` holds the ASCII codes of sequence `i`, upper-cased and right padded
    /// with `0` up to the longest sequence. An empty list or an empty sequence is
    /// rejected, as is anything outside printable ASCII.
    pub fn from_sequences<S: AsRef<str>>(
        name: impl Into<String>,
        sequences: &[S],
    ) -> Result<Self, BackendError> {
        let name = name.into();
        if sequences.is_empty() {
            return Err(BackendError::invalid_input(name, "no sequences given"));
        }
        for (i, seq) in sequences.iter().enumerate() {
            let seq = seq.as_ref();
            if seq.is_empty() {
                return Err(BackendError::invalid_input(
                    name,
                    format!("sequence {i} is empty"),
                ));
            }
            if let Some(c) = seq.chars().find(|c| !c.is_ascii_graphic()) {
                return Err(BackendError::invalid_input(
                    name,
                    format!("sequence {i} contains unsupported character {c:?}"),
                ));
            }
        }
        Self::from_ascii_rows(name, sequences)
    }

    /// Like [`NamedTensor::from_sequences`] but empty rows are allowed, as decoded
    /// model output can legitimately be empty. The width is at least one.
    pub fn from_ascii_rows<S: AsRef<str>>(
        name: impl Into<String>,
        rows: &[S],
    ) -> Result<Self, BackendError> {
        let width = rows.iter().map(|s| s.as_ref().len()).max().unwrap_or(0);
        Self::from_ascii_rows_padded(name, rows, width)
    }

    /// Encode rows into exactly `width` columns (at least one). A row longer
    /// than `width` is an error.
    pub fn from_ascii_rows_padded<S: AsRef<str>>(
        name: impl Into<String>,
        rows: &[S],
        width: usize,
    ) -> Result<Self, BackendError> {
        let name = name.into();
        let width = width.max(1);
        if let Some(row) = rows.iter().position(|s| s.as_ref().len() > width) {
            return Err(BackendError::invalid_input(
                name,
                format!("row {row} does not fit in {width} columns"),
            ));
        }
        let mut data = vec![0i32; rows.len() * width];
        for (row, seq) in rows.iter().enumerate() {
            let seq = seq.as_ref().to_ascii_uppercase();
            for (col, byte) in seq.bytes().enumerate() {
                data[row * width + col] = byte as i32;
            }
        }
        Self::new(name, vec![rows.len(), width], TensorData::Int32(data))
    }

    /// Decode an `int32` `[batch, width]` tensor of ASCII codes back into strings.
    /// Each row stops at its first `0`.
    pub fn to_sequences(&self) -> Result<Vec<String>, BackendError> {
        let TensorData::Int32(codes) = &self.data else {
            return Err(BackendError::invalid_input(
                &self.name,
                format!("expected int32 residue codes, found {}", self.dtype()),
            ));
        };
        if self.shape.len() != 2 {
            return Err(BackendError::invalid_input(
                &self.name,
                format!("expected shape [batch, width], found {:?}", self.shape),
            ));
        }
        codes
            .chunks(self.shape[1])
            .enumerate()
            .map(|(row, chunk)| {
                chunk
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| match u8::try_from(c) {
                        Ok(b) if b.is_ascii() => Ok(b as char),
                        _ => Err(BackendError::invalid_input(
                            &self.name,
                            format!("row {row} holds non-ASCII code {c}"),
                        )),
                    })
                    .collect()
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Number of rows along the batch dimension.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    /// Copy out rows `range` along the batch dimension.
    pub fn slice_rows(&self, range: Range<usize>) -> Result<NamedTensor, BackendError> {
        if range.start >= range.end || range.end > self.rows() {
            return Err(BackendError::invalid_input(
                &self.name,
                format!("row range {:?} outside of {} rows", range, self.rows()),
            ));
        }
        let row_len = self.row_len();
        let data = self
            .data
            .slice(range.start * row_len..range.end * row_len);
        let mut shape = self.shape.clone();
        shape[0] = range.end - range.start;
        NamedTensor::new(self.name.clone(), shape, data)
    }

    /// Stack tensors along the batch dimension, keeping their order.
    ///
    /// All parts must share name, dtype and trailing dimensions.
    pub fn concat_rows(parts: Vec<NamedTensor>) -> Result<NamedTensor, String> {
        let mut parts = parts.into_iter();
        let first = parts
            .next()
            .ok_or_else(|| "nothing to concatenate".to_string())?;
        let NamedTensor {
            name,
            mut shape,
            mut data,
        } = first;

        for part in parts {
            if part.name != name || part.shape[1..] != shape[1..] {
                return Err(format!(
                    "cannot stack `{}` {:?} onto `{}` {:?}",
                    part.name, part.shape, name, shape
                ));
            }
            match (&mut data, part.data) {
                (TensorData::Int32(a), TensorData::Int32(b)) => a.extend(b),
                (TensorData::Int64(a), TensorData::Int64(b)) => a.extend(b),
                (TensorData::Float32(a), TensorData::Float32(b)) => a.extend(b),
                (TensorData::Float16(a), TensorData::Float16(b)) => a.extend(b),
                (a, b) => {
                    return Err(format!(
                        "cannot stack {} rows onto {} rows of `{}`",
                        b.dtype(),
                        a.dtype(),
                        name
                    ))
                }
            }
            shape[0] += part.shape[0];
        }
        NamedTensor::new(name, shape, data).map_err(|e| e.to_string())
    }
}
