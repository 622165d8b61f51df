//! Which chunk cells of a placed source intersect a view.
//!
//! Enumeration is stateless: every call starts from the view and the source
//! transform alone.

use foundation::math::{Frustum, vec};
use foundation::{Aabb3, BoxN};
use serde::{Deserialize, Serialize};

use crate::request::{ChunkPriority, GridPosition, PriorityTier, SourceId};
use crate::transform::{SourceTransform, TransformError};

/// Priority gap between adjacent scales. In-scale distance terms are clamped
/// to half of it, so a finer scale always outranks a coarser one.
pub const SCALE_PRIORITY_STEP: f64 = 1.0e9;

/// Degenerate view extents are widened to this many model units.
const MIN_VIEW_EXTENT: f64 = 1.0;

/// A viewport in model space.
///
/// `view_min`/`view_max` bound the visible region along each display
/// dimension, in model units; a slice view uses the slab thickness for the
/// third one. Non-display model dimensions are fixed at `position`, which
/// selects the unit slab `[floor(p), floor(p) + 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub display_dimensions: Vec<usize>,
    pub position: Vec<f64>,
    pub view_min: [f64; 3],
    pub view_max: [f64; 3],
    /// Model units per screen pixel.
    pub pixel_size: f64,
    /// Desired screen pixels per voxel.
    #[serde(default = "default_render_scale_target")]
    pub render_scale_target: f64,
    /// Extra margin (model units) around the view whose chunks are
    /// requested at prefetch priority.
    #[serde(default)]
    pub prefetch_margin: f64,
}

fn default_render_scale_target() -> f64 {
    1.0
}

impl ViewSpec {
    /// A view centred on `position` reaching `half_extents` along each
    /// display dimension.
    pub fn centered(
        display_dimensions: Vec<usize>,
        position: Vec<f64>,
        half_extents: [f64; 3],
        pixel_size: f64,
    ) -> Self {
        let center = vec::select3(&position, &display_dimensions);
        Self {
            view_min: [0, 1, 2].map(|i| center[i] - half_extents[i]),
            view_max: [0, 1, 2].map(|i| center[i] + half_extents[i]),
            display_dimensions,
            position,
            pixel_size,
            render_scale_target: default_render_scale_target(),
            prefetch_margin: 0.0,
        }
    }

    pub fn model_rank(&self) -> usize {
        self.position.len()
    }

    pub fn validate(&self, model_rank: usize) -> Result<(), TransformError> {
        if self.position.len() != model_rank {
            return Err(TransformError::RankMismatch {
                what: "view position",
                expected: model_rank,
                got: self.position.len(),
            });
        }
        if self.display_dimensions.len() > 3 {
            return Err(TransformError::RankMismatch {
                what: "display dimensions",
                expected: 3,
                got: self.display_dimensions.len(),
            });
        }
        if let Some(&dim) = self.display_dimensions.iter().find(|&&d| d >= model_rank) {
            return Err(TransformError::DisplayDimension {
                dim,
                rank: model_rank,
            });
        }
        Ok(())
    }

    pub fn center3(&self) -> [f64; 3] {
        vec::select3(&self.position, &self.display_dimensions)
    }

    /// Display-space box of the view grown by `margin`. Unused display slots
    /// hold `[-0.5, 0.5]` to match the zero padding of [`vec::select3`].
    pub fn display_box(&self, margin: f64) -> Aabb3 {
        let mut min = [-0.5; 3];
        let mut max = [0.5; 3];
        for slot in 0..self.display_dimensions.len().min(3) {
            let mut lo = self.view_min[slot] - margin;
            let mut hi = self.view_max[slot] + margin;
            if hi - lo < MIN_VIEW_EXTENT {
                let c = 0.5 * (lo + hi);
                lo = c - 0.5 * MIN_VIEW_EXTENT;
                hi = c + 0.5 * MIN_VIEW_EXTENT;
            }
            min[slot] = lo;
            max[slot] = hi;
        }
        Aabb3::new(min, max)
    }

    fn display_slot(&self, dim: usize) -> Option<usize> {
        self.display_dimensions
            .iter()
            .take(3)
            .position(|&d| d == dim)
    }

    /// Model-space box of the view grown by `margin`.
    pub fn model_box(&self, margin: f64) -> BoxN {
        let display = self.display_box(margin);
        let mut lower = Vec::with_capacity(self.model_rank());
        let mut upper = Vec::with_capacity(self.model_rank());
        for (d, &p) in self.position.iter().enumerate() {
            match self.display_slot(d) {
                Some(slot) => {
                    lower.push(display.min[slot]);
                    upper.push(display.max[slot]);
                }
                None => {
                    lower.push(p.floor());
                    upper.push(p.floor() + 1.0);
                }
            }
        }
        BoxN::new(lower, upper)
    }

    /// Whether `model_box` overlaps the slab along every non-display dimension.
    fn overlaps_slab(&self, model_box: &BoxN) -> bool {
        self.position.iter().enumerate().all(|(d, &p)| {
            self.display_slot(d).is_some()
                || (model_box.lower[d] < p.floor() + 1.0 && p.floor() < model_box.upper[d])
        })
    }
}

/// A source selected for a view, with its rank among the selected scales
/// (0 is the finest one the view asked for).
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleSource {
    pub transform: SourceTransform,
    pub scale_offset: u32,
}

impl VisibleSource {
    pub fn source(&self) -> SourceId {
        self.transform.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibleChunk {
    pub source: SourceId,
    pub position: GridPosition,
    pub priority: ChunkPriority,
    pub display_bounds: Aabb3,
}

/// Priority value for a chunk `distance` away from the view centre.
pub fn scale_priority(scale_offset: u32, distance: f64) -> f64 {
    -f64::from(scale_offset) * SCALE_PRIORITY_STEP - distance.clamp(0.0, 0.5 * SCALE_PRIORITY_STEP)
}

/// Every chunk cell of `source` that intersects `view`.
///
/// The view box is mapped into voxel space to bound the candidate grid
/// range; each candidate's display-space box is then tested against the view
/// frustum. Only the finest selected scale gets prefetch chunks.
pub fn visible_chunks(source: &VisibleSource, view: &ViewSpec) -> Vec<VisibleChunk> {
    let t = &source.transform;
    let rank = t.rank();
    if view.model_rank() != rank {
        return Vec::new();
    }
    let margin = if source.scale_offset == 0 {
        view.prefetch_margin.max(0.0)
    } else {
        0.0
    };

    let voxel_corners: Vec<Vec<f64>> = view
        .model_box(margin)
        .corners()
        .iter()
        .map(|c| t.model_to_voxel.apply_point(c))
        .collect();
    let Some(voxel_box) = BoxN::from_points(rank, voxel_corners.iter().map(Vec::as_slice)) else {
        return Vec::new();
    };
    let voxel_box = voxel_box.intersect(&t.clip_box());
    if voxel_box.is_empty() {
        return Vec::new();
    }

    let shape = t.grid_shape();
    let mut lo = Vec::with_capacity(rank);
    let mut hi = Vec::with_capacity(rank);
    for d in 0..rank {
        let origin = t.lower_voxel_bound[d] as f64;
        let c = f64::from(t.chunk_data_size[d]);
        lo.push((((voxel_box.lower[d] - origin) / c).floor() as i64).max(0));
        hi.push((((voxel_box.upper[d] - origin) / c).ceil() as i64).min(shape[d]));
    }

    let inner = Frustum::orthographic(&view.display_box(0.0));
    let outer = Frustum::orthographic(&view.display_box(margin));
    let center = view.center3();
    let mut out = Vec::new();

    for_each_cell(&lo, &hi, |cell| {
        let chunk_box = t.chunk_voxel_box(cell);
        if chunk_box.is_empty() {
            return;
        }
        let model_corners: Vec<Vec<f64>> = chunk_box
            .corners()
            .iter()
            .map(|c| t.voxel_to_model.apply_point(c))
            .collect();
        let Some(model_box) = BoxN::from_points(rank, model_corners.iter().map(Vec::as_slice))
        else {
            return;
        };
        if !view.overlaps_slab(&model_box) {
            return;
        }
        let Some(display) = Aabb3::from_points(
            model_corners
                .iter()
                .map(|c| vec::select3(c, &view.display_dimensions)),
        ) else {
            return;
        };

        let tier = if inner.intersects_aabb(&display) {
            PriorityTier::Visible
        } else if margin > 0.0 && outer.intersects_aabb(&display) {
            PriorityTier::Prefetch
        } else {
            return;
        };
        let distance = vec::distance(&display.center(), &center);
        out.push(VisibleChunk {
            source: t.source,
            position: GridPosition::new(cell.to_vec()),
            priority: ChunkPriority::new(tier, scale_priority(source.scale_offset, distance)),
            display_bounds: display,
        });
    });
    out
}

/// Calls `f` for every cell of the half-open range `[lo, hi)`, first
/// dimension fastest.
fn for_each_cell(lo: &[i64], hi: &[i64], mut f: impl FnMut(&[i64])) {
    if lo.iter().zip(hi).any(|(a, b)| a >= b) {
        return;
    }
    let mut cell = lo.to_vec();
    loop {
        f(&cell);
        let mut d = 0;
        loop {
            if d == cell.len() {
                return;
            }
            cell[d] += 1;
            if cell[d] < hi[d] {
                break;
            }
            cell[d] = lo[d];
            d += 1;
        }
    }
}
