use std::cmp::Ordering;
use std::fmt;

use foundation::ObjectId;
use foundation::math::StableF64;
use serde::{Deserialize, Serialize};

/// Identifies a chunk source. Allocated once by the owning context and never
/// reused, so mirrors can treat ids of disposed sources as tombstones.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl From<ObjectId> for SourceId {
    fn from(id: ObjectId) -> Self {
        Self(id.get())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Identifies a render layer. Chosen by the consuming context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// One viewport (panel) of the consuming context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(pub u64);

/// One outstanding `fetch_chunk` continuation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// Chunk coordinates in a source's chunk grid, one entry per dimension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridPosition(pub Vec<i64>);

impl GridPosition {
    pub fn new(coords: impl Into<Vec<i64>>) -> Self {
        Self(coords.into())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn coords(&self) -> &[i64] {
        &self.0
    }
}

impl From<Vec<i64>> for GridPosition {
    fn from(coords: Vec<i64>) -> Self {
        Self(coords)
    }
}

impl fmt::Display for GridPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(i64::to_string).collect();
        write!(f, "[{}]", parts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey {
    pub source: SourceId,
    pub position: GridPosition,
}

impl ChunkKey {
    pub fn new(source: SourceId, position: impl Into<GridPosition>) -> Self {
        Self {
            source,
            position: position.into(),
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.source, self.position)
    }
}

/// Coarse priority class. Any `Visible` chunk outranks every `Prefetch` one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Prefetch = 0,
    Visible = 1,
}

/// Admission priority: tier first, then value. Greater is more urgent.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ChunkPriority {
    pub tier: PriorityTier,
    pub value: f64,
}

impl ChunkPriority {
    pub fn new(tier: PriorityTier, value: f64) -> Self {
        Self { tier, value }
    }

    pub fn visible(value: f64) -> Self {
        Self::new(PriorityTier::Visible, value)
    }

    pub fn prefetch(value: f64) -> Self {
        Self::new(PriorityTier::Prefetch, value)
    }
}

impl PartialEq for ChunkPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChunkPriority {}

impl PartialOrd for ChunkPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then_with(|| StableF64(self.value).cmp(&StableF64(other.value)))
    }
}
