use foundation::math::Affine;

use crate::request::SourceId;
use crate::selection::{ViewSpec, VisibleSource};
use crate::source::ChunkSourceSpec;
use crate::transform::{LayerTransform, SourceTransform, TransformError, compute_source_transform};

/// One resolution level: a chunk source plus its voxel → layer transform.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleResolutionSource {
    pub source: SourceId,
    pub spec: ChunkSourceSpec,
    pub voxel_to_layer: Affine,
}

/// A layer's data at several resolutions and, optionally, several chunk
/// orientations. Each orientation lists its scales fine → coarse.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiscaleSource {
    rank: usize,
    channel_extents: Vec<u32>,
    orientations: Vec<Vec<SingleResolutionSource>>,
}

impl MultiscaleSource {
    pub fn new(
        rank: usize,
        channel_extents: Vec<u32>,
        orientations: Vec<Vec<SingleResolutionSource>>,
    ) -> Result<Self, TransformError> {
        if orientations.is_empty() || orientations.iter().any(Vec::is_empty) {
            return Err(TransformError::NoSources);
        }
        if let Some(s) = orientations
            .iter()
            .flatten()
            .find(|s| s.spec.rank() > rank)
        {
            return Err(TransformError::RankMismatch {
                what: "source",
                expected: rank,
                got: s.spec.rank(),
            });
        }
        Ok(Self {
            rank,
            channel_extents,
            orientations,
        })
    }

    /// A single orientation, scales fine → coarse.
    pub fn from_scales(
        rank: usize,
        scales: Vec<SingleResolutionSource>,
    ) -> Result<Self, TransformError> {
        Self::new(rank, Vec::new(), vec![scales])
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn channel_extents(&self) -> &[u32] {
        &self.channel_extents
    }

    pub fn orientations(&self) -> &[Vec<SingleResolutionSource>] {
        &self.orientations
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.orientations.iter().flatten().map(|s| s.source).collect()
    }

    /// Model-space placement of every source, per orientation.
    pub fn transforms(
        &self,
        layer: &LayerTransform,
    ) -> Result<Vec<Vec<SourceTransform>>, TransformError> {
        self.orientations
            .iter()
            .map(|scales| {
                scales
                    .iter()
                    .map(|s| {
                        compute_source_transform(
                            s.source,
                            &s.spec,
                            &s.voxel_to_layer,
                            self.rank,
                            &self.channel_extents,
                            layer,
                        )
                    })
                    .collect()
            })
            .collect()
    }

    /// Picks an orientation and the scales to draw for `view`: the finest
    /// scale whose voxels are at least as small as the render-scale target
    /// asks for, plus every coarser scale as a fallback.
    pub fn select(
        &self,
        transforms: &[Vec<SourceTransform>],
        view: &ViewSpec,
    ) -> Result<Vec<VisibleSource>, TransformError> {
        view.validate(self.rank)?;
        let Some(scales) = transforms.get(choose_orientation(transforms, view)) else {
            return Err(TransformError::NoSources);
        };
        let first = choose_scale(scales, view);
        Ok(scales[first..]
            .iter()
            .enumerate()
            .map(|(offset, transform)| VisibleSource {
                transform: transform.clone(),
                scale_offset: offset as u32,
            })
            .collect())
    }
}

/// Dimensions along which the view is thin: the third display dimension of
/// a 3-d view, otherwise every non-display dimension.
fn view_normal_dims(view: &ViewSpec) -> Vec<usize> {
    if view.display_dimensions.len() == 3 {
        return vec![view.display_dimensions[2]];
    }
    (0..view.model_rank())
        .filter(|d| !view.display_dimensions.contains(d))
        .collect()
}

/// Orientation whose finest chunks are shallowest along the view normal.
/// Ties keep the earlier orientation.
pub fn choose_orientation(transforms: &[Vec<SourceTransform>], view: &ViewSpec) -> usize {
    let normal = view_normal_dims(view);
    transforms
        .iter()
        .enumerate()
        .filter_map(|(i, scales)| {
            let finest = scales.first()?;
            let depth: f64 = normal.iter().map(|&d| finest.chunk_extent_along(d)).sum();
            Some((i, depth))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Index of the coarsest scale still meeting the target voxel size, or the
/// finest scale when none does.
pub fn choose_scale(scales: &[SourceTransform], view: &ViewSpec) -> usize {
    let target = view.pixel_size * view.render_scale_target;
    let dims: Vec<usize> = view.display_dimensions.iter().copied().take(3).collect();
    scales
        .iter()
        .enumerate()
        .filter(|(_, t)| t.voxel_size(&dims) <= target * (1.0 + 1e-6))
        .max_by(|a, b| a.1.voxel_size(&dims).total_cmp(&b.1.voxel_size(&dims)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
