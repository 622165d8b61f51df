//! Messages between the owning context and its consumers.
//!
//! Both directions are serde enums tagged by `type`, so any transport that
//! carries JSON (a channel, a worker port, a socket) can carry them. Owner
//! messages about one object carry that object's sequence number. A mirror
//! ignores any message whose sequence is not newer than what it has, which
//! makes redelivery harmless.

use foundation::math::{Affine, MatrixError};
use serde::{Deserialize, Serialize};

use crate::request::{ChunkPriority, GridPosition, LayerId, PriorityTier, SourceId, ViewId};
use crate::residency::ChunkState;
use crate::selection::{ViewSpec, VisibleSource};
use crate::source::SpecError;
use crate::transform::{SourceTransform, TransformError};

/// Serialized form of [`Affine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAffine {
    pub out_rank: usize,
    pub in_rank: usize,
    /// Row-major.
    pub linear: Vec<f64>,
    pub translation: Vec<f64>,
}

impl From<&Affine> for WireAffine {
    fn from(a: &Affine) -> Self {
        Self {
            out_rank: a.out_rank(),
            in_rank: a.in_rank(),
            linear: a.linear().to_vec(),
            translation: a.translation().to_vec(),
        }
    }
}

impl TryFrom<WireAffine> for Affine {
    type Error = MatrixError;

    fn try_from(w: WireAffine) -> Result<Self, Self::Error> {
        Affine::new(w.out_rank, w.in_rank, w.linear, w.translation)
    }
}

/// One source a view of a layer shows, as sent to the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireVisibleSource {
    pub view_id: ViewId,
    pub source_id: SourceId,
    pub voxel_to_model: WireAffine,
    pub chunk_data_size: Vec<u32>,
    pub lower_voxel_bound: Vec<i64>,
    pub upper_voxel_bound: Vec<i64>,
    pub lower_clip: Vec<f64>,
    pub upper_clip: Vec<f64>,
    pub scale_offset: u32,
}

impl WireVisibleSource {
    pub fn new(view_id: ViewId, source: &VisibleSource) -> Self {
        let t = &source.transform;
        Self {
            view_id,
            source_id: t.source,
            voxel_to_model: WireAffine::from(&t.voxel_to_model),
            chunk_data_size: t.chunk_data_size.clone(),
            lower_voxel_bound: t.lower_voxel_bound.clone(),
            upper_voxel_bound: t.upper_voxel_bound.clone(),
            lower_clip: t.lower_clip.clone(),
            upper_clip: t.upper_clip.clone(),
            scale_offset: source.scale_offset,
        }
    }

    /// Rebuilds the transform on the receiving side, re-deriving the inverse.
    /// Geometry that would make chunk enumeration meaningless (zero chunk
    /// sizes, empty voxel bounds, inverted clip bounds) is rejected.
    pub fn into_visible(self) -> Result<(ViewId, VisibleSource), TransformError> {
        let rank = self.chunk_data_size.len();
        if rank == 0 {
            return Err(SpecError::NoDimensions.into());
        }
        let lengths = [
            ("voxel_to_model", self.voxel_to_model.in_rank),
            ("lower_voxel_bound", self.lower_voxel_bound.len()),
            ("upper_voxel_bound", self.upper_voxel_bound.len()),
            ("lower_clip", self.lower_clip.len()),
            ("upper_clip", self.upper_clip.len()),
        ];
        if let Some(&(what, got)) = lengths.iter().find(|(_, len)| *len != rank) {
            return Err(TransformError::RankMismatch {
                what,
                expected: rank,
                got,
            });
        }
        if let Some(d) = self.chunk_data_size.iter().position(|&c| c == 0) {
            return Err(SpecError::ZeroChunkSize(d).into());
        }
        let empty = (0..rank).find(|&d| {
            self.lower_voxel_bound[d] >= self.upper_voxel_bound[d]
                || !(self.lower_clip[d] <= self.upper_clip[d])
        });
        if let Some(d) = empty {
            return Err(SpecError::EmptyBounds(d).into());
        }

        let voxel_to_model = Affine::try_from(self.voxel_to_model)?;
        let model_to_voxel = voxel_to_model.inverse()?;
        Ok((
            self.view_id,
            VisibleSource {
                transform: SourceTransform {
                    source: self.source_id,
                    voxel_to_model,
                    model_to_voxel,
                    chunk_data_size: self.chunk_data_size,
                    lower_voxel_bound: self.lower_voxel_bound,
                    upper_voxel_bound: self.upper_voxel_bound,
                    lower_clip: self.lower_clip,
                    upper_clip: self.upper_clip,
                },
                scale_offset: self.scale_offset,
            },
        ))
    }
}

/// Consumer → owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerMessage {
    /// Replaces the full visible-source set of a layer.
    AddVisibleLayer {
        layer_id: LayerId,
        sources: Vec<WireVisibleSource>,
        /// Set when the consumer could not compute the layer's sources.
        #[serde(default)]
        diagnostic: Option<String>,
    },
    RemoveVisibleLayer {
        layer_id: LayerId,
    },
    UpdateView {
        view_id: ViewId,
        view: ViewSpec,
    },
    RemoveView {
        view_id: ViewId,
    },
    RequestSnapshot,
}

/// Owner → consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OwnerMessage {
    ChunkStateChanged {
        source_id: SourceId,
        grid_position: GridPosition,
        new_state: ChunkState,
        seq: u64,
    },
    PriorityChanged {
        source_id: SourceId,
        grid_position: GridPosition,
        tier: PriorityTier,
        value: f64,
        seq: u64,
    },
    SourceDisposed {
        source_id: SourceId,
        seq: u64,
    },
    /// `message: None` clears an earlier diagnostic.
    LayerDiagnostic {
        layer_id: LayerId,
        message: Option<String>,
        seq: u64,
    },
    Snapshot(Snapshot),
}

impl OwnerMessage {
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            OwnerMessage::ChunkStateChanged { source_id, .. }
            | OwnerMessage::PriorityChanged { source_id, .. }
            | OwnerMessage::SourceDisposed { source_id, .. } => Some(*source_id),
            OwnerMessage::LayerDiagnostic { .. } | OwnerMessage::Snapshot(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub grid_position: GridPosition,
    pub state: ChunkState,
    pub tier: PriorityTier,
    pub value: f64,
}

impl ChunkSnapshot {
    pub fn priority(&self) -> ChunkPriority {
        ChunkPriority::new(self.tier, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source_id: SourceId,
    pub seq: u64,
    pub chunks: Vec<ChunkSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub layer_id: LayerId,
    pub seq: u64,
    pub diagnostic: Option<String>,
}

/// Complete owner state, for rebuilding a mirror from scratch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sources: Vec<SourceSnapshot>,
    pub layers: Vec<LayerSnapshot>,
}

#[cfg(test)]
mod tests {
    use foundation::math::Affine;
    use pretty_assertions::assert_eq;

    use super::{ConsumerMessage, OwnerMessage, WireAffine, WireVisibleSource};
    use crate::request::{GridPosition, LayerId, SourceId, ViewId};
    use crate::residency::ChunkState;
    use crate::selection::VisibleSource;
    use crate::source::SpecError;
    use crate::transform::{SourceTransform, TransformError};

    fn wire_source() -> WireVisibleSource {
        let voxel_to_model = Affine::scale_translate(&[1.0, 1.0], &[0.0, 0.0]);
        let visible = VisibleSource {
            transform: SourceTransform {
                source: SourceId(1),
                model_to_voxel: voxel_to_model.clone(),
                voxel_to_model,
                chunk_data_size: vec![8, 8],
                lower_voxel_bound: vec![0, 0],
                upper_voxel_bound: vec![16, 16],
                lower_clip: vec![0.0, 0.0],
                upper_clip: vec![16.0, 16.0],
            },
            scale_offset: 0,
        };
        WireVisibleSource::new(ViewId(1), &visible)
    }

    #[test]
    fn owner_messages_are_tagged() {
        let msg = OwnerMessage::ChunkStateChanged {
            source_id: SourceId(4),
            grid_position: GridPosition::new(vec![1, 0, 0]),
            new_state: ChunkState::SystemMemory,
            seq: 9,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "chunk_state_changed",
                "source_id": 4,
                "grid_position": [1, 0, 0],
                "new_state": "system_memory",
                "seq": 9
            })
        );
        let back: OwnerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn consumer_message_parses_from_json() {
        let msg: ConsumerMessage =
            serde_json::from_str(r#"{ "type": "remove_visible_layer", "layer_id": 3 }"#).unwrap();
        assert_eq!(msg, ConsumerMessage::RemoveVisibleLayer { layer_id: LayerId(3) });
    }

    #[test]
    fn visible_source_rebuilds_inverse_on_receipt() {
        let voxel_to_model = Affine::scale_translate(&[2.0, 2.0], &[4.0, 0.0]);
        let visible = VisibleSource {
            transform: SourceTransform {
                source: SourceId(1),
                model_to_voxel: voxel_to_model.inverse().unwrap(),
                voxel_to_model,
                chunk_data_size: vec![8, 8],
                lower_voxel_bound: vec![0, 0],
                upper_voxel_bound: vec![16, 16],
                lower_clip: vec![0.0, 0.0],
                upper_clip: vec![16.0, 16.0],
            },
            scale_offset: 1,
        };
        let wire = WireVisibleSource::new(ViewId(2), &visible);
        let (view, back) = wire.into_visible().unwrap();
        assert_eq!(view, ViewId(2));
        assert_eq!(back, visible);
    }

    #[test]
    fn malformed_wire_affine_is_rejected() {
        let wire = WireAffine {
            out_rank: 2,
            in_rank: 2,
            linear: vec![1.0; 3],
            translation: vec![0.0; 2],
        };
        assert!(Affine::try_from(wire).is_err());
    }

    #[test]
    fn degenerate_wire_geometry_is_rejected() {
        assert!(wire_source().into_visible().is_ok());

        let mut zero_chunk = wire_source();
        zero_chunk.chunk_data_size = vec![0, 8];
        assert_eq!(
            zero_chunk.into_visible().unwrap_err(),
            TransformError::Spec(SpecError::ZeroChunkSize(0))
        );

        let mut empty_volume = wire_source();
        empty_volume.upper_voxel_bound = vec![16, 0];
        assert_eq!(
            empty_volume.into_visible().unwrap_err(),
            TransformError::Spec(SpecError::EmptyBounds(1))
        );

        let mut inverted_clip = wire_source();
        inverted_clip.lower_clip = vec![20.0, 0.0];
        assert_eq!(
            inverted_clip.into_visible().unwrap_err(),
            TransformError::Spec(SpecError::EmptyBounds(0))
        );

        let mut nan_clip = wire_source();
        nan_clip.upper_clip = vec![16.0, f64::NAN];
        assert!(nan_clip.into_visible().is_err());

        let mut ragged = wire_source();
        ragged.lower_voxel_bound.pop();
        assert!(matches!(
            ragged.into_visible(),
            Err(TransformError::RankMismatch {
                what: "lower_voxel_bound",
                ..
            })
        ));
    }
}
