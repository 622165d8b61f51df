//! Voxel ↔ model coordinate transforms for chunk sources.

use foundation::BoxN;
use foundation::math::{Affine, MatrixError};

use crate::request::SourceId;
use crate::source::{ChunkSourceSpec, SpecError};

/// A render layer's placement in model space.
///
/// `error` carries a failure reported by whatever produced the transform
/// (for example a dimension mismatch in user input). Such a layer contributes
/// no sources. `revision` changes whenever the transform does, so cached
/// per-source transforms can be invalidated cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerTransform {
    pub layer_to_model: Affine,
    pub error: Option<String>,
    pub revision: u64,
}

impl LayerTransform {
    pub fn identity(rank: usize) -> Self {
        Self::new(Affine::identity(rank))
    }

    pub fn new(layer_to_model: Affine) -> Self {
        Self {
            layer_to_model,
            error: None,
            revision: 0,
        }
    }

    pub fn failed(rank: usize, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::identity(rank)
        }
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("{0}")]
    Upstream(String),
    #[error("{what} has rank {got}, expected {expected}")]
    RankMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("channel dimension {dim} has extent {got}, layer expects {expected}")]
    ChannelExtentMismatch { dim: usize, expected: u32, got: u32 },
    #[error("display dimension {dim} is outside a rank {rank} model space")]
    DisplayDimension { dim: usize, rank: usize },
    #[error("layer has no sources")]
    NoSources,
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// One source placed in model space, with its grid padded to the model rank.
///
/// Padded dimensions have a single voxel `[0, 1)` and a single chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTransform {
    pub source: SourceId,
    pub voxel_to_model: Affine,
    pub model_to_voxel: Affine,
    pub chunk_data_size: Vec<u32>,
    pub lower_voxel_bound: Vec<i64>,
    pub upper_voxel_bound: Vec<i64>,
    pub lower_clip: Vec<f64>,
    pub upper_clip: Vec<f64>,
}

impl SourceTransform {
    pub fn rank(&self) -> usize {
        self.chunk_data_size.len()
    }

    pub fn clip_box(&self) -> BoxN {
        BoxN::new(self.lower_clip.clone(), self.upper_clip.clone())
    }

    pub fn grid_shape(&self) -> Vec<i64> {
        (0..self.rank())
            .map(|d| {
                let span = self.upper_voxel_bound[d] - self.lower_voxel_bound[d];
                let c = i64::from(self.chunk_data_size[d]);
                (span + c - 1).div_euclid(c)
            })
            .collect()
    }

    /// Voxel box of grid cell `cell`, clipped to the volume and clip bounds.
    pub fn chunk_voxel_box(&self, cell: &[i64]) -> BoxN {
        let mut lower = Vec::with_capacity(self.rank());
        let mut upper = Vec::with_capacity(self.rank());
        for (d, &p) in cell.iter().enumerate() {
            let c = i64::from(self.chunk_data_size[d]);
            let lo = self.lower_voxel_bound[d] + p * c;
            let hi = (lo + c).min(self.upper_voxel_bound[d]);
            lower.push((lo as f64).max(self.lower_clip[d]));
            upper.push((hi as f64).min(self.upper_clip[d]));
        }
        BoxN::new(lower, upper)
    }

    /// Model-space extent of one voxel along model dimension `dim`.
    pub fn voxel_size_along(&self, dim: usize) -> f64 {
        self.voxel_to_model.row_norm(dim)
    }

    /// Geometric mean of the voxel size over `dims`. Exact only when the
    /// voxel → model transform is a permutation with scaling.
    pub fn voxel_size(&self, dims: &[usize]) -> f64 {
        if dims.is_empty() {
            return 1.0;
        }
        let log_sum: f64 = dims.iter().map(|&d| self.voxel_size_along(d).ln()).sum();
        (log_sum / dims.len() as f64).exp()
    }

    /// Model-space size of a full chunk along model dimension `dim`.
    pub fn chunk_extent_along(&self, dim: usize) -> f64 {
        (0..self.rank())
            .map(|c| self.voxel_to_model.get(dim, c).abs() * f64::from(self.chunk_data_size[c]))
            .sum()
    }
}

/// Places `spec` (voxel → layer via `voxel_to_layer`) into model space
/// through `layer`. `layer_rank` is the rank shared by every source of the
/// layer; lower-rank sources are padded.
pub fn compute_source_transform(
    source: SourceId,
    spec: &ChunkSourceSpec,
    voxel_to_layer: &Affine,
    layer_rank: usize,
    channel_extents: &[u32],
    layer: &LayerTransform,
) -> Result<SourceTransform, TransformError> {
    if let Some(message) = &layer.error {
        return Err(TransformError::Upstream(message.clone()));
    }
    spec.validate()?;

    let rank = spec.rank();
    if rank > layer_rank {
        return Err(TransformError::RankMismatch {
            what: "source",
            expected: layer_rank,
            got: rank,
        });
    }
    if voxel_to_layer.in_rank() != rank || voxel_to_layer.out_rank() != rank {
        return Err(TransformError::RankMismatch {
            what: "voxel transform",
            expected: rank,
            got: voxel_to_layer.in_rank(),
        });
    }
    let l2m = &layer.layer_to_model;
    if l2m.in_rank() != layer_rank || l2m.out_rank() != layer_rank {
        return Err(TransformError::RankMismatch {
            what: "layer transform",
            expected: layer_rank,
            got: l2m.in_rank(),
        });
    }
    check_channels(&spec.channel_extents, channel_extents)?;

    let voxel_to_model = l2m.compose(&voxel_to_layer.pad_to(layer_rank)?)?;
    let model_to_voxel = voxel_to_model.inverse()?;

    let pad = layer_rank - rank;
    let clip = spec.clip_box();
    let padded = |v: &[i64], fill: i64| {
        let mut out = v.to_vec();
        out.extend(std::iter::repeat_n(fill, pad));
        out
    };
    let padded_f64 = |v: &[f64], fill: f64| {
        let mut out = v.to_vec();
        out.extend(std::iter::repeat_n(fill, pad));
        out
    };
    let mut chunk_data_size = spec.chunk_data_size.clone();
    chunk_data_size.extend(std::iter::repeat_n(1, pad));

    Ok(SourceTransform {
        source,
        voxel_to_model,
        model_to_voxel,
        chunk_data_size,
        lower_voxel_bound: padded(&spec.lower_voxel_bound, 0),
        upper_voxel_bound: padded(&spec.upper_voxel_bound, 1),
        lower_clip: padded_f64(&clip.lower, 0.0),
        upper_clip: padded_f64(&clip.upper, 1.0),
    })
}

fn check_channels(source: &[u32], layer: &[u32]) -> Result<(), TransformError> {
    if source.len() != layer.len() {
        return Err(TransformError::RankMismatch {
            what: "channel dimensions",
            expected: layer.len(),
            got: source.len(),
        });
    }
    match source.iter().zip(layer).position(|(s, l)| s != l) {
        Some(dim) => Err(TransformError::ChannelExtentMismatch {
            dim,
            expected: layer[dim],
            got: source[dim],
        }),
        None => Ok(()),
    }
}
