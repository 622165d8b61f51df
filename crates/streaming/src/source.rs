use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use foundation::BoxN;
use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::fetch::DataSource;
use crate::payload::{ChunkFormat, DataType, DecodeTarget};
use crate::request::{GridPosition, SourceId};

/// Geometry and element type of one single-resolution chunk source.
///
/// Voxel space is partitioned into a regular grid of `chunk_data_size` cells
/// anchored at `lower_voxel_bound`. Cells on the upper edge are clipped to
/// `upper_voxel_bound`. An optional clip box further limits which voxels are
/// considered to contain data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSourceSpec {
    pub data_type: DataType,
    pub chunk_data_size: Vec<u32>,
    pub lower_voxel_bound: Vec<i64>,
    pub upper_voxel_bound: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_clip_bound: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_clip_bound: Option<Vec<i64>>,
    /// Extents of non-spatial channel dimensions stored inside each chunk.
    #[serde(default)]
    pub channel_extents: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("{field} has {got} dimensions, expected {expected}")]
    Rank {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("chunk size is zero in dimension {0}")]
    ZeroChunkSize(usize),
    #[error("voxel bounds are empty in dimension {0}")]
    EmptyBounds(usize),
    #[error("source has no spatial dimensions")]
    NoDimensions,
}

impl ChunkSourceSpec {
    /// Unclipped spec for a volume `[0, shape)` split into `chunk` cells.
    pub fn new(data_type: DataType, chunk: &[u32], shape: &[i64]) -> Self {
        Self {
            data_type,
            chunk_data_size: chunk.to_vec(),
            lower_voxel_bound: vec![0; shape.len()],
            upper_voxel_bound: shape.to_vec(),
            lower_clip_bound: None,
            upper_clip_bound: None,
            channel_extents: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.chunk_data_size.len()
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        let rank = self.rank();
        if rank == 0 {
            return Err(SpecError::NoDimensions);
        }
        let check = |field: &'static str, got: usize| {
            if got == rank {
                Ok(())
            } else {
                Err(SpecError::Rank {
                    field,
                    expected: rank,
                    got,
                })
            }
        };
        check("lower_voxel_bound", self.lower_voxel_bound.len())?;
        check("upper_voxel_bound", self.upper_voxel_bound.len())?;
        if let Some(b) = &self.lower_clip_bound {
            check("lower_clip_bound", b.len())?;
        }
        if let Some(b) = &self.upper_clip_bound {
            check("upper_clip_bound", b.len())?;
        }
        if let Some(d) = self.chunk_data_size.iter().position(|&c| c == 0) {
            return Err(SpecError::ZeroChunkSize(d));
        }
        if let Some(d) =
            (0..rank).find(|&d| self.lower_voxel_bound[d] >= self.upper_voxel_bound[d])
        {
            return Err(SpecError::EmptyBounds(d));
        }
        Ok(())
    }

    /// Number of grid cells per dimension.
    pub fn grid_shape(&self) -> Vec<i64> {
        (0..self.rank())
            .map(|d| {
                let span = self.upper_voxel_bound[d] - self.lower_voxel_bound[d];
                let c = i64::from(self.chunk_data_size[d]);
                (span + c - 1).div_euclid(c)
            })
            .collect()
    }

    pub fn contains_position(&self, position: &GridPosition) -> bool {
        position.rank() == self.rank()
            && position
                .coords()
                .iter()
                .zip(self.grid_shape())
                .all(|(&p, n)| (0..n).contains(&p))
    }

    /// Voxel range `[lower, upper)` covered by a cell, clipped to the
    /// volume bounds.
    pub fn chunk_voxel_range(&self, position: &GridPosition) -> (Vec<i64>, Vec<i64>) {
        let mut lower = Vec::with_capacity(self.rank());
        let mut upper = Vec::with_capacity(self.rank());
        for (d, &p) in position.coords().iter().enumerate().take(self.rank()) {
            let c = i64::from(self.chunk_data_size[d]);
            let lo = self.lower_voxel_bound[d] + p * c;
            lower.push(lo);
            upper.push((lo + c).min(self.upper_voxel_bound[d]));
        }
        (lower, upper)
    }

    /// Spatial extents of a cell, smaller than `chunk_data_size` at the
    /// upper edge of the volume.
    pub fn chunk_extents(&self, position: &GridPosition) -> Vec<u32> {
        let (lower, upper) = self.chunk_voxel_range(position);
        lower
            .iter()
            .zip(&upper)
            .map(|(lo, hi)| u32::try_from((hi - lo).max(0)).unwrap_or(0))
            .collect()
    }

    pub fn clip_box(&self) -> BoxN {
        let to_f64 = |v: &[i64]| v.iter().map(|&x| x as f64).collect::<Vec<_>>();
        let lower = self
            .lower_clip_bound
            .as_deref()
            .unwrap_or(&self.lower_voxel_bound);
        let upper = self
            .upper_clip_bound
            .as_deref()
            .unwrap_or(&self.upper_voxel_bound);
        BoxN::new(to_f64(lower), to_f64(upper))
    }

    pub fn decode_target(&self, position: &GridPosition) -> DecodeTarget {
        let mut extents = self.chunk_extents(position);
        let mut stored_extents = self.chunk_data_size.clone();
        extents.extend_from_slice(&self.channel_extents);
        stored_extents.extend_from_slice(&self.channel_extents);
        DecodeTarget {
            data_type: self.data_type,
            extents,
            stored_extents,
        }
    }
}

/// Identity of a source: two descriptors that compare equal share one
/// source object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    pub format: String,
    pub spec: ChunkSourceSpec,
}

/// Owner-side state of one chunk source.
pub(crate) struct ChunkSource {
    pub(crate) id: SourceId,
    pub(crate) descriptor: Arc<SourceDescriptor>,
    pub(crate) data_source: Arc<dyn DataSource>,
    pub(crate) format: Arc<dyn ChunkFormat>,
    pub(crate) chunks: HashMap<GridPosition, Chunk>,
    ref_count: u32,
    seq: u64,
}

impl fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSource")
            .field("id", &self.id)
            .field("url", &self.descriptor.url)
            .field("data_source", &self.data_source.name())
            .field("format", &self.format.name())
            .field("chunks", &self.chunks.len())
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

impl ChunkSource {
    pub(crate) fn new(
        id: SourceId,
        descriptor: Arc<SourceDescriptor>,
        data_source: Arc<dyn DataSource>,
        format: Arc<dyn ChunkFormat>,
    ) -> Self {
        Self {
            id,
            descriptor,
            data_source,
            format,
            chunks: HashMap::new(),
            ref_count: 1,
            seq: 0,
        }
    }

    pub(crate) fn spec(&self) -> &ChunkSourceSpec {
        &self.descriptor.spec
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub(crate) fn retain(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    /// Returns the remaining count.
    pub(crate) fn release(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    /// Sequence number for the next message about this source or its chunks.
    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkSourceSpec, SpecError};
    use crate::payload::DataType;
    use crate::request::GridPosition;

    fn spec() -> ChunkSourceSpec {
        ChunkSourceSpec::new(DataType::Uint8, &[64, 64, 64], &[100, 128, 64])
    }

    #[test]
    fn grid_shape_rounds_up() {
        assert_eq!(spec().grid_shape(), vec![2, 2, 1]);
    }

    #[test]
    fn edge_chunks_are_clipped() {
        let spec = spec();
        assert_eq!(spec.chunk_extents(&GridPosition::new(vec![0, 0, 0])), vec![64, 64, 64]);
        assert_eq!(spec.chunk_extents(&GridPosition::new(vec![1, 1, 0])), vec![36, 64, 64]);

        let target = spec.decode_target(&GridPosition::new(vec![1, 0, 0]));
        assert_eq!(target.extents, vec![36, 64, 64]);
        assert_eq!(target.stored_extents, vec![64, 64, 64]);
    }

    #[test]
    fn positions_outside_grid_are_rejected() {
        let spec = spec();
        assert!(spec.contains_position(&GridPosition::new(vec![1, 1, 0])));
        assert!(!spec.contains_position(&GridPosition::new(vec![2, 0, 0])));
        assert!(!spec.contains_position(&GridPosition::new(vec![-1, 0, 0])));
        assert!(!spec.contains_position(&GridPosition::new(vec![0, 0])));
    }

    #[test]
    fn validation_catches_bad_specs() {
        assert_eq!(spec().validate(), Ok(()));

        let mut zero = spec();
        zero.chunk_data_size[1] = 0;
        assert_eq!(zero.validate(), Err(SpecError::ZeroChunkSize(1)));

        let mut ragged = spec();
        ragged.upper_voxel_bound.pop();
        assert!(matches!(ragged.validate(), Err(SpecError::Rank { .. })));

        let mut empty = spec();
        empty.upper_voxel_bound[2] = 0;
        assert_eq!(empty.validate(), Err(SpecError::EmptyBounds(2)));
    }

    #[test]
    fn clip_box_defaults_to_voxel_bounds() {
        let mut spec = spec();
        assert_eq!(spec.clip_box().upper, vec![100.0, 128.0, 64.0]);
        spec.upper_clip_bound = Some(vec![50, 50, 50]);
        assert_eq!(spec.clip_box().upper, vec![50.0, 50.0, 50.0]);
    }
}
