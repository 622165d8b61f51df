//! Decoded chunk payloads and the format seam that produces them.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Float32,
}

impl DataType {
    pub fn bytes_per_element(self) -> usize {
        match self {
            DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Uint64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayloadData {
    Uint8(Vec<u8>),
    Int8(Vec<i8>),
    Uint16(Vec<u16>),
    Int16(Vec<i16>),
    Uint32(Vec<u32>),
    Int32(Vec<i32>),
    Uint64(Vec<u64>),
    Float32(Vec<f32>),
}

impl PayloadData {
    pub fn data_type(&self) -> DataType {
        match self {
            PayloadData::Uint8(_) => DataType::Uint8,
            PayloadData::Int8(_) => DataType::Int8,
            PayloadData::Uint16(_) => DataType::Uint16,
            PayloadData::Int16(_) => DataType::Int16,
            PayloadData::Uint32(_) => DataType::Uint32,
            PayloadData::Int32(_) => DataType::Int32,
            PayloadData::Uint64(_) => DataType::Uint64,
            PayloadData::Float32(_) => DataType::Float32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PayloadData::Uint8(v) => v.len(),
            PayloadData::Int8(v) => v.len(),
            PayloadData::Uint16(v) => v.len(),
            PayloadData::Int16(v) => v.len(),
            PayloadData::Uint32(v) => v.len(),
            PayloadData::Int32(v) => v.len(),
            PayloadData::Uint64(v) => v.len(),
            PayloadData::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `len` elements all equal to `value`, rounded into the target type.
    pub fn filled(data_type: DataType, len: usize, value: f64) -> Self {
        match data_type {
            DataType::Uint8 => PayloadData::Uint8(vec![value as u8; len]),
            DataType::Int8 => PayloadData::Int8(vec![value as i8; len]),
            DataType::Uint16 => PayloadData::Uint16(vec![value as u16; len]),
            DataType::Int16 => PayloadData::Int16(vec![value as i16; len]),
            DataType::Uint32 => PayloadData::Uint32(vec![value as u32; len]),
            DataType::Int32 => PayloadData::Int32(vec![value as i32; len]),
            DataType::Uint64 => PayloadData::Uint64(vec![value as u64; len]),
            DataType::Float32 => PayloadData::Float32(vec![value as f32; len]),
        }
    }
}

/// A decoded chunk. `extents` lists elements per dimension, first dimension
/// varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPayload {
    pub data: PayloadData,
    pub extents: Vec<u32>,
}

impl ChunkPayload {
    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.data_type().bytes_per_element()
    }
}

/// What the decoder should produce for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeTarget {
    pub data_type: DataType,
    /// Extents of this chunk, clipped at the volume's upper bound.
    pub extents: Vec<u32>,
    /// Extents of a full grid cell, for stores that pad edge chunks.
    pub stored_extents: Vec<u32>,
}

impl DecodeTarget {
    pub fn num_elements(&self) -> usize {
        self.extents.iter().map(|&e| e as usize).product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is {got} bytes, expected {expected}")]
    Length { expected: usize, got: usize },
    #[error("invalid chunk shape: {0}")]
    Shape(String),
    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

/// Turns fetched bytes into a typed payload.
///
/// Implementations are registered by name and shared between every source
/// that uses them, so they must be stateless or internally synchronized.
pub trait ChunkFormat: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn decode(&self, raw: &[u8], target: &DecodeTarget) -> Result<ChunkPayload, DecodeError>;

    /// Bytes charged against the system memory budget.
    fn size_in_bytes(&self, payload: &ChunkPayload) -> usize {
        payload.size_in_bytes()
    }

    /// Value a consumer should assume for elements it has no data for.
    fn fill_value(&self, _data_type: DataType) -> f64 {
        0.0
    }
}

/// Uncompressed little-endian samples. Edge chunks may arrive either clipped
/// or padded to the full cell size; padded input is cropped.
#[derive(Debug, Default, Copy, Clone)]
pub struct RawFormat;

impl ChunkFormat for RawFormat {
    fn name(&self) -> &str {
        "raw"
    }

    fn decode(&self, raw: &[u8], target: &DecodeTarget) -> Result<ChunkPayload, DecodeError> {
        if target.extents.len() != target.stored_extents.len() {
            return Err(DecodeError::Shape(format!(
                "rank {} does not match stored rank {}",
                target.extents.len(),
                target.stored_extents.len()
            )));
        }
        if let Some(d) = (0..target.extents.len())
            .find(|&d| target.extents[d] > target.stored_extents[d])
        {
            return Err(DecodeError::Shape(format!(
                "dimension {d} extent {} exceeds cell size {}",
                target.extents[d], target.stored_extents[d]
            )));
        }

        let elem = target.data_type.bytes_per_element();
        let clipped_len = target.num_elements() * elem;
        let stored_len = target
            .stored_extents
            .iter()
            .map(|&e| e as usize)
            .product::<usize>()
            * elem;

        let cropped;
        let bytes = if raw.len() == clipped_len {
            raw
        } else if raw.len() == stored_len {
            cropped = crop(raw, elem, &target.stored_extents, &target.extents);
            &cropped[..]
        } else {
            return Err(DecodeError::Length {
                expected: clipped_len,
                got: raw.len(),
            });
        };

        let data = match target.data_type {
            DataType::Uint8 => PayloadData::Uint8(bytes.to_vec()),
            DataType::Int8 => PayloadData::Int8(bytes.iter().map(|&b| b as i8).collect()),
            DataType::Uint16 => PayloadData::Uint16(le_words(bytes, u16::from_le_bytes)),
            DataType::Int16 => PayloadData::Int16(le_words(bytes, i16::from_le_bytes)),
            DataType::Uint32 => PayloadData::Uint32(le_words(bytes, u32::from_le_bytes)),
            DataType::Int32 => PayloadData::Int32(le_words(bytes, i32::from_le_bytes)),
            DataType::Uint64 => PayloadData::Uint64(le_words(bytes, u64::from_le_bytes)),
            DataType::Float32 => PayloadData::Float32(le_words(bytes, f32::from_le_bytes)),
        };
        Ok(ChunkPayload {
            data,
            extents: target.extents.clone(),
        })
    }
}

fn le_words<const N: usize, T>(raw: &[u8], from_le: fn([u8; N]) -> T) -> Vec<T> {
    raw.chunks_exact(N)
        .map(|c| {
            let mut word = [0u8; N];
            word.copy_from_slice(c);
            from_le(word)
        })
        .collect()
}

/// Copies the `extents` sub-block out of a `stored`-shaped buffer.
/// Rows along dimension 0 are contiguous in both.
fn crop(raw: &[u8], elem: usize, stored: &[u32], extents: &[u32]) -> Vec<u8> {
    let rank = extents.len();
    if rank == 0 {
        return raw.to_vec();
    }
    let total: usize = extents.iter().map(|&e| e as usize).product();
    let mut out = Vec::with_capacity(total * elem);
    if total == 0 {
        return out;
    }

    let mut strides = vec![1usize; rank];
    for d in 1..rank {
        strides[d] = strides[d - 1] * stored[d - 1] as usize;
    }
    let row = extents[0] as usize * elem;
    let mut index = vec![0usize; rank];
    loop {
        let offset = (1..rank).map(|d| index[d] * strides[d]).sum::<usize>() * elem;
        out.extend_from_slice(&raw[offset..offset + row]);

        let mut d = 1;
        loop {
            if d == rank {
                return out;
            }
            index[d] += 1;
            if index[d] < extents[d] as usize {
                break;
            }
            index[d] = 0;
            d += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkFormat, DataType, DecodeError, DecodeTarget, PayloadData, RawFormat};

    fn target(data_type: DataType, extents: &[u32], stored: &[u32]) -> DecodeTarget {
        DecodeTarget {
            data_type,
            extents: extents.to_vec(),
            stored_extents: stored.to_vec(),
        }
    }

    #[test]
    fn decodes_little_endian_words() {
        let raw = [1u8, 0, 0, 1];
        let payload = RawFormat
            .decode(&raw, &target(DataType::Uint16, &[2], &[2]))
            .unwrap();
        assert_eq!(payload.data, PayloadData::Uint16(vec![1, 256]));
        assert_eq!(payload.size_in_bytes(), 4);
    }

    #[test]
    fn crops_padded_edge_chunk() {
        // 3x2 cell holding a 2x2 chunk; values are x + 10 * y.
        let raw = [0u8, 1, 2, 10, 11, 12];
        let payload = RawFormat
            .decode(&raw, &target(DataType::Uint8, &[2, 2], &[3, 2]))
            .unwrap();
        assert_eq!(payload.data, PayloadData::Uint8(vec![0, 1, 10, 11]));
        assert_eq!(payload.extents, vec![2, 2]);
    }

    #[test]
    fn crops_in_three_dimensions() {
        let raw: Vec<u8> = (0..8).collect();
        let payload = RawFormat
            .decode(&raw, &target(DataType::Uint8, &[1, 1, 2], &[2, 2, 2]))
            .unwrap();
        assert_eq!(payload.data, PayloadData::Uint8(vec![0, 4]));
    }

    #[test]
    fn rejects_wrong_length() {
        let err = RawFormat
            .decode(&[0u8; 3], &target(DataType::Uint16, &[2], &[2]))
            .unwrap_err();
        assert_eq!(err, DecodeError::Length { expected: 4, got: 3 });
    }

    #[test]
    fn rejects_extent_larger_than_cell() {
        let err = RawFormat
            .decode(&[0u8; 4], &target(DataType::Uint8, &[4], &[2]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Shape(_)));
    }

    #[test]
    fn fill_value_defaults_to_zero() {
        let fill = RawFormat.fill_value(DataType::Float32);
        assert_eq!(
            PayloadData::filled(DataType::Float32, 2, fill),
            PayloadData::Float32(vec![0.0, 0.0])
        );
    }
}
