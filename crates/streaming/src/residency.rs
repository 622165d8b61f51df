use serde::{Deserialize, Serialize};

/// Chunk lifecycle states.
///
/// Queued → Downloading → SystemMemory → GpuMemory, with Downloading falling
/// back to Queued for a retry or ending in FailedPermanent. Every live state
/// can move to Disposed, which is terminal: a chunk that comes back is a new
/// chunk object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Queued,
    Downloading,
    SystemMemory,
    GpuMemory,
    FailedPermanent,
    Disposed,
}

impl ChunkState {
    pub fn can_transition_to(self, next: ChunkState) -> bool {
        use ChunkState::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Queued, Downloading) => true,
            (Downloading, SystemMemory | FailedPermanent | Queued) => true,
            (SystemMemory, GpuMemory) => true,
            _ => false,
        }
    }

    /// Data is decoded and available to consumers.
    pub fn is_usable(self) -> bool {
        matches!(self, ChunkState::SystemMemory | ChunkState::GpuMemory)
    }

    /// Waiting for a fetch slot or a fetch result.
    pub fn is_pending(self) -> bool {
        matches!(self, ChunkState::Queued | ChunkState::Downloading)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal chunk transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ChunkState,
    pub to: ChunkState,
}

/// Validated state holder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Residency {
    state: ChunkState,
}

impl Residency {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Queued,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn advance(&mut self, to: ChunkState) -> Result<ChunkState, TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }
}

impl Default for Residency {
    fn default() -> Self {
        Self::new()
    }
}
