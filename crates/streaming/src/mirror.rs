//! Consumer-side projection of the owner's chunk state.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::{OwnerMessage, Snapshot};
use crate::request::{ChunkKey, ChunkPriority, GridPosition, LayerId, SourceId};
use crate::residency::ChunkState;

#[derive(Debug, Clone, PartialEq)]
pub struct MirroredChunk {
    pub state: ChunkState,
    /// Known once the owner has reported one.
    pub priority: Option<ChunkPriority>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct MirroredSource {
    seq: u64,
    chunks: BTreeMap<GridPosition, MirroredChunk>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct MirroredLayer {
    seq: u64,
    diagnostic: Option<String>,
}

/// Last known owner state, built only from owner messages.
///
/// Each source and layer tracks the highest sequence number applied. A
/// message that is not newer changes nothing, so redelivery is harmless.
/// Disposed sources leave a tombstone; their ids are never reused, so late
/// messages about them are dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorState {
    sources: BTreeMap<SourceId, MirroredSource>,
    disposed: BTreeMap<SourceId, u64>,
    layers: BTreeMap<LayerId, MirroredLayer>,
    applied: u64,
    ignored: u64,
}

impl MirrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `message`; returns whether anything changed.
    pub fn apply(&mut self, message: &OwnerMessage) -> bool {
        let changed = match message {
            OwnerMessage::ChunkStateChanged {
                source_id,
                grid_position,
                new_state,
                seq,
            } => match self.source_for(*source_id, *seq) {
                Some(source) => {
                    if *new_state == ChunkState::Disposed {
                        source.chunks.remove(grid_position);
                    } else {
                        source
                            .chunks
                            .entry(grid_position.clone())
                            .and_modify(|c| c.state = *new_state)
                            .or_insert(MirroredChunk {
                                state: *new_state,
                                priority: None,
                            });
                    }
                    true
                }
                None => false,
            },
            OwnerMessage::PriorityChanged {
                source_id,
                grid_position,
                tier,
                value,
                seq,
            } => match self.source_for(*source_id, *seq) {
                Some(source) => {
                    if let Some(chunk) = source.chunks.get_mut(grid_position) {
                        chunk.priority = Some(ChunkPriority::new(*tier, *value));
                    }
                    true
                }
                None => false,
            },
            OwnerMessage::SourceDisposed { source_id, seq } => {
                if self.disposed.contains_key(source_id)
                    || self.sources.get(source_id).is_some_and(|s| s.seq >= *seq)
                {
                    false
                } else {
                    self.sources.remove(source_id);
                    self.disposed.insert(*source_id, *seq);
                    true
                }
            }
            OwnerMessage::LayerDiagnostic {
                layer_id,
                message,
                seq,
            } => {
                let layer = self.layers.entry(*layer_id).or_default();
                if *seq <= layer.seq {
                    false
                } else {
                    layer.seq = *seq;
                    layer.diagnostic = message.clone();
                    true
                }
            }
            OwnerMessage::Snapshot(snapshot) => {
                self.rebuild(snapshot);
                true
            }
        };
        if changed {
            self.applied += 1;
        } else {
            self.ignored += 1;
            trace!(?message, "ignoring stale owner message");
        }
        changed
    }

    /// The source's entry if `seq` is newer than anything applied to it.
    fn source_for(&mut self, id: SourceId, seq: u64) -> Option<&mut MirroredSource> {
        if self.disposed.contains_key(&id) {
            return None;
        }
        let source = self.sources.entry(id).or_default();
        if seq <= source.seq {
            return None;
        }
        source.seq = seq;
        Some(source)
    }

    fn rebuild(&mut self, snapshot: &Snapshot) {
        self.sources = snapshot
            .sources
            .iter()
            .map(|s| {
                let chunks = s
                    .chunks
                    .iter()
                    .map(|c| {
                        (
                            c.grid_position.clone(),
                            MirroredChunk {
                                state: c.state,
                                priority: Some(c.priority()),
                            },
                        )
                    })
                    .collect();
                (s.source_id, MirroredSource { seq: s.seq, chunks })
            })
            .collect();
        self.layers = snapshot
            .layers
            .iter()
            .map(|l| {
                (
                    l.layer_id,
                    MirroredLayer {
                        seq: l.seq,
                        diagnostic: l.diagnostic.clone(),
                    },
                )
            })
            .collect();
    }

    pub fn chunk(&self, key: &ChunkKey) -> Option<&MirroredChunk> {
        self.sources.get(&key.source)?.chunks.get(&key.position)
    }

    pub fn chunk_state(&self, key: &ChunkKey) -> Option<ChunkState> {
        self.chunk(key).map(|c| c.state)
    }

    /// Safe to draw: decoded and not yet disposed.
    pub fn is_usable(&self, key: &ChunkKey) -> bool {
        self.chunk_state(key).is_some_and(ChunkState::is_usable)
    }

    pub fn usable_chunks(&self, source: SourceId) -> Vec<GridPosition> {
        self.sources
            .get(&source)
            .map(|s| {
                s.chunks
                    .iter()
                    .filter(|(_, c)| c.state.is_usable())
                    .map(|(p, _)| p.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn chunk_count(&self, source: SourceId) -> usize {
        self.sources.get(&source).map_or(0, |s| s.chunks.len())
    }

    pub fn source_seq(&self, source: SourceId) -> Option<u64> {
        self.sources.get(&source).map(|s| s.seq)
    }

    pub fn is_disposed(&self, source: SourceId) -> bool {
        self.disposed.contains_key(&source)
    }

    pub fn diagnostic(&self, layer: LayerId) -> Option<&str> {
        self.layers.get(&layer)?.diagnostic.as_deref()
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn ignored(&self) -> u64 {
        self.ignored
    }
}

/// A [`MirrorState`] fed by the owner's outbox.
#[derive(Debug)]
pub struct Mirror {
    rx: mpsc::UnboundedReceiver<OwnerMessage>,
    state: MirrorState,
}

impl Mirror {
    pub fn new(rx: mpsc::UnboundedReceiver<OwnerMessage>) -> Self {
        Self {
            rx,
            state: MirrorState::new(),
        }
    }

    pub fn state(&self) -> &MirrorState {
        &self.state
    }

    /// Applies every message already delivered; returns how many arrived.
    pub fn pump(&mut self) -> usize {
        let mut received = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.state.apply(&message);
            received += 1;
        }
        received
    }

    /// Waits for one message and applies it. `None` once the owner is gone.
    pub async fn recv(&mut self) -> Option<OwnerMessage> {
        let message = self.rx.recv().await?;
        self.state.apply(&message);
        Some(message)
    }

    /// Applies messages until `done` holds. Returns `false` if the owner
    /// went away first.
    pub async fn wait_until(&mut self, done: impl Fn(&MirrorState) -> bool) -> bool {
        while !done(&self.state) {
            if self.recv().await.is_none() {
                return done(&self.state);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::MirrorState;
    use crate::protocol::{ChunkSnapshot, LayerSnapshot, OwnerMessage, Snapshot, SourceSnapshot};
    use crate::request::{ChunkKey, GridPosition, LayerId, PriorityTier, SourceId};
    use crate::residency::ChunkState;

    fn pos() -> GridPosition {
        GridPosition::new(vec![0, 1, 0])
    }

    fn state(seq: u64, new_state: ChunkState) -> OwnerMessage {
        OwnerMessage::ChunkStateChanged {
            source_id: SourceId(1),
            grid_position: pos(),
            new_state,
            seq,
        }
    }

    #[test]
    fn redelivery_is_a_no_op() {
        let mut mirror = MirrorState::new();
        let messages = [
            state(1, ChunkState::Queued),
            state(2, ChunkState::Downloading),
            state(3, ChunkState::SystemMemory),
        ];
        for m in &messages {
            assert!(mirror.apply(m));
        }
        let once = mirror.clone();
        for m in &messages {
            assert!(!mirror.apply(m));
        }
        assert_eq!(
            mirror.chunk_state(&ChunkKey::new(SourceId(1), pos())),
            Some(ChunkState::SystemMemory)
        );
        assert_eq!(mirror.ignored(), 3);
        assert_eq!(mirror.source_seq(SourceId(1)), once.source_seq(SourceId(1)));
    }

    #[test]
    fn stale_state_never_overwrites_newer() {
        let mut mirror = MirrorState::new();
        mirror.apply(&state(5, ChunkState::SystemMemory));
        mirror.apply(&state(4, ChunkState::Downloading));
        let key = ChunkKey::new(SourceId(1), pos());
        assert!(mirror.is_usable(&key));

        mirror.apply(&state(6, ChunkState::Disposed));
        assert_eq!(mirror.chunk_state(&key), None);
        assert!(!mirror.is_usable(&key));
    }

    #[test]
    fn disposed_sources_ignore_late_messages() {
        let mut mirror = MirrorState::new();
        mirror.apply(&state(1, ChunkState::Queued));
        assert!(mirror.apply(&OwnerMessage::SourceDisposed {
            source_id: SourceId(1),
            seq: 2,
        }));
        assert!(mirror.is_disposed(SourceId(1)));
        assert!(!mirror.apply(&state(3, ChunkState::Queued)));
        assert_eq!(mirror.chunk_count(SourceId(1)), 0);
        assert!(!mirror.apply(&OwnerMessage::SourceDisposed {
            source_id: SourceId(1),
            seq: 2,
        }));
    }

    #[test]
    fn diagnostics_follow_layer_sequence() {
        let mut mirror = MirrorState::new();
        let set = OwnerMessage::LayerDiagnostic {
            layer_id: LayerId(7),
            message: Some("rank mismatch".into()),
            seq: 1,
        };
        assert!(mirror.apply(&set));
        assert!(!mirror.apply(&set));
        assert_eq!(mirror.diagnostic(LayerId(7)), Some("rank mismatch"));

        mirror.apply(&OwnerMessage::LayerDiagnostic {
            layer_id: LayerId(7),
            message: None,
            seq: 2,
        });
        assert_eq!(mirror.diagnostic(LayerId(7)), None);
    }

    #[test]
    fn snapshot_matches_incremental_state() {
        let mut incremental = MirrorState::new();
        incremental.apply(&state(1, ChunkState::Queued));
        incremental.apply(&OwnerMessage::PriorityChanged {
            source_id: SourceId(1),
            grid_position: pos(),
            tier: PriorityTier::Visible,
            value: -2.0,
            seq: 2,
        });
        incremental.apply(&state(3, ChunkState::Downloading));

        let mut rebuilt = MirrorState::new();
        rebuilt.apply(&state(1, ChunkState::FailedPermanent));
        rebuilt.apply(&OwnerMessage::Snapshot(Snapshot {
            sources: vec![SourceSnapshot {
                source_id: SourceId(1),
                seq: 3,
                chunks: vec![ChunkSnapshot {
                    grid_position: pos(),
                    state: ChunkState::Downloading,
                    tier: PriorityTier::Visible,
                    value: -2.0,
                }],
            }],
            layers: vec![LayerSnapshot {
                layer_id: LayerId(1),
                seq: 0,
                diagnostic: None,
            }],
        }));

        let key = ChunkKey::new(SourceId(1), pos());
        assert_eq!(rebuilt.chunk(&key), incremental.chunk(&key));
        assert_eq!(rebuilt.source_seq(SourceId(1)), Some(3));
        // Anything older than the snapshot is stale afterwards.
        assert!(!rebuilt.apply(&state(3, ChunkState::SystemMemory)));
        assert!(rebuilt.apply(&state(4, ChunkState::SystemMemory)));
    }
}
