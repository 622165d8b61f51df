//! The owning side of the pipeline: every source, chunk and fetch lives here.
//!
//! `ChunkManager` is single-writer state. Fetches run as spawned tokio tasks
//! that never touch it; they report through an internal channel that the
//! driver drains with [`ChunkManager::next_outcome`] and
//! [`ChunkManager::handle_outcome`] (the actor does this in its loop).
//! Methods that may start fetches must be called from within a tokio runtime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use foundation::{IdAllocator, ObjectId};
use runtime::metrics::Metrics;
use runtime::{CancellationToken, EventBus, Generation, WorkQueueFull};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, MemoryBudget, ResidencyCache};
use crate::chunk::{Chunk, ChunkRequest};
use crate::config::{ConfigError, StreamingConfig};
use crate::fetch::{ChunkError, DataSource, FetchError, FetchRequest};
use crate::payload::{ChunkFormat, ChunkPayload, DecodeError, DecodeTarget};
use crate::protocol::{
    ChunkSnapshot, ConsumerMessage, LayerSnapshot, OwnerMessage, Snapshot, SourceSnapshot,
};
use crate::queue::{ChunkQueueManager, InFlight};
use crate::registration::SourceRefs;
use crate::registry::{Registry, RegistryError};
use crate::request::{ChunkKey, ChunkPriority, GridPosition, LayerId, RequestId, SourceId, ViewId};
use crate::residency::{ChunkState, TransitionError};
use crate::selection::{ViewSpec, VisibleSource, visible_chunks};
use crate::source::{ChunkSource, SourceDescriptor, SpecError};

pub const SOURCES_OPENED: &str = "sources.opened";
pub const SOURCES_DISPOSED: &str = "sources.disposed";
pub const CHUNKS_CREATED: &str = "chunks.created";
pub const CHUNKS_DISPOSED: &str = "chunks.disposed";
pub const CHUNKS_EVICTED: &str = "chunks.evicted";
pub const CHUNKS_WITHDRAWN: &str = "chunks.withdrawn";
pub const CHUNK_BYTES: &str = "chunks.bytes";
pub const FETCH_STARTED: &str = "fetch.started";
pub const FETCH_COMPLETED: &str = "fetch.completed";
pub const FETCH_FAILED: &str = "fetch.failed";
pub const FETCH_RETRIES: &str = "fetch.retries";
pub const FETCH_CANCELLED: &str = "fetch.cancelled";
pub const FETCH_STALE: &str = "fetch.stale";
pub const QUEUE_REJECTED: &str = "queue.rejected";
pub const QUEUE_LEN: &str = "queue.len";
pub const IN_FLIGHT: &str = "fetch.in_flight";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error("no chunk {0}")]
    UnknownChunk(ChunkKey),
    #[error("{0} is outside the source grid")]
    OutOfBounds(ChunkKey),
    #[error(transparent)]
    QueueFull(#[from] WorkQueueFull),
    #[error("{key} is {state:?}, not resident")]
    NotResident { key: ChunkKey, state: ChunkState },
    #[error("invalid source: {0}")]
    InvalidSpec(#[from] SpecError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("chunk manager has shut down")]
    Closed,
}

enum AttemptError {
    Fetch(FetchError),
    Decode(DecodeError),
}

enum Outcome {
    Fetched {
        key: ChunkKey,
        instance: ObjectId,
        attempt: u32,
        result: Result<ChunkPayload, AttemptError>,
    },
    RetryDue {
        key: ChunkKey,
        instance: ObjectId,
    },
}

/// Report from a fetch or retry timer, to be fed to
/// [`ChunkManager::handle_outcome`].
pub struct FetchOutcome(Outcome);

impl fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Outcome::Fetched { key, attempt, .. } => f
                .debug_struct("Fetched")
                .field("key", key)
                .field("attempt", attempt)
                .finish(),
            Outcome::RetryDue { key, .. } => f.debug_struct("RetryDue").field("key", key).finish(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Interest {
    /// Asked for by a priority round; lapses when a later round skips it.
    Round,
    /// Asked for by a `fetch_chunk` waiter; lasts as long as the waiter.
    Waiter,
}

#[derive(Debug, Default)]
struct ActiveLayer {
    sources: Vec<(ViewId, VisibleSource)>,
    diagnostic: Option<String>,
}

/// Everything a spawned fetch needs, detached from the manager.
struct FetchTask {
    tx: mpsc::UnboundedSender<FetchOutcome>,
    key: ChunkKey,
    instance: ObjectId,
    data_source: Arc<dyn DataSource>,
    format: Arc<dyn ChunkFormat>,
    target: DecodeTarget,
}

impl FetchTask {
    fn spawn(self, request: FetchRequest) {
        tokio::spawn(async move {
            let cancel = request.cancel.clone();
            let attempt = request.attempt;
            if cancel.is_cancelled() {
                return;
            }
            let Some(fetched) = cancel.run_until_cancelled(self.data_source.fetch(request)).await
            else {
                return;
            };
            let result = match fetched {
                Ok(raw) => self
                    .format
                    .decode(&raw, &self.target)
                    .map_err(AttemptError::Decode),
                Err(error) => Err(AttemptError::Fetch(error)),
            };
            // A closed channel means the manager is gone.
            let _ = self.tx.send(FetchOutcome(Outcome::Fetched {
                key: self.key,
                instance: self.instance,
                attempt,
                result,
            }));
        });
    }
}

fn emit_state(
    events: &mut EventBus<OwnerMessage>,
    source: &mut ChunkSource,
    position: &GridPosition,
    state: ChunkState,
) {
    let seq = source.next_seq();
    events.emit(OwnerMessage::ChunkStateChanged {
        source_id: source.id,
        grid_position: position.clone(),
        new_state: state,
        seq,
    });
}

fn chunk_in<'a>(
    sources: &'a mut HashMap<SourceId, ChunkSource>,
    key: &ChunkKey,
) -> Result<&'a mut Chunk, ManagerError> {
    sources
        .get_mut(&key.source)
        .ok_or(ManagerError::UnknownSource(key.source))?
        .chunks
        .get_mut(&key.position)
        .ok_or_else(|| ManagerError::UnknownChunk(key.clone()))
}

/// Canonical chunk state for one owning context.
#[derive(Debug)]
pub struct ChunkManager {
    config: StreamingConfig,
    registry: Arc<Registry>,
    ids: IdAllocator,
    sources: HashMap<SourceId, ChunkSource>,
    by_descriptor: HashMap<Arc<SourceDescriptor>, SourceId>,
    queue: ChunkQueueManager,
    cache: ResidencyCache,
    events: EventBus<OwnerMessage>,
    metrics: Metrics,
    generation: Generation,
    next_request: u64,
    /// Outstanding `fetch_chunk` waiters; each holds one source reference.
    requests: HashMap<RequestId, ChunkKey>,
    outcomes_tx: mpsc::UnboundedSender<FetchOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    layers: BTreeMap<LayerId, ActiveLayer>,
    /// Outlives removed layers so a re-added layer keeps counting up.
    layer_seqs: BTreeMap<LayerId, u64>,
    views: BTreeMap<ViewId, ViewSpec>,
}

impl ChunkManager {
    pub fn new(config: StreamingConfig, registry: Arc<Registry>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Ok(Self {
            queue: ChunkQueueManager::new(
                config.max_inflight,
                config.max_queued,
                config.retry_policy(),
            ),
            cache: ResidencyCache::new(MemoryBudget::new(config.system_memory_bytes)),
            events: EventBus::new(config.event_capacity),
            config,
            registry,
            ids: IdAllocator::new(),
            sources: HashMap::new(),
            by_descriptor: HashMap::new(),
            metrics: Metrics::new(),
            generation: Generation::default(),
            next_request: 0,
            requests: HashMap::new(),
            outcomes_tx,
            outcomes_rx,
            layers: BTreeMap::new(),
            layer_seqs: BTreeMap::new(),
            views: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // ---- sources ----

    /// Returns the source for `descriptor`, opening it on first use. Every
    /// call takes one reference.
    pub fn acquire_source(
        &mut self,
        descriptor: SourceDescriptor,
    ) -> Result<SourceId, ManagerError> {
        if let Some(&id) = self.by_descriptor.get(&descriptor)
            && let Some(source) = self.sources.get_mut(&id)
        {
            let refs = source.retain();
            debug!(source = %id, refs, "source shared");
            return Ok(id);
        }

        descriptor.spec.validate()?;
        let data_source = self.registry.open(&descriptor.url, &descriptor.spec)?;
        let format = self.registry.format(&descriptor.format)?;
        let id = SourceId::from(self.ids.allocate());
        let descriptor = Arc::new(descriptor);
        info!(
            source = %id,
            url = %descriptor.url,
            format = format.name(),
            data_source = data_source.name(),
            "source opened"
        );
        self.sources
            .insert(id, ChunkSource::new(id, descriptor.clone(), data_source, format));
        self.by_descriptor.insert(descriptor, id);
        self.metrics.inc(SOURCES_OPENED);
        Ok(id)
    }

    pub fn retain_source(&mut self, id: SourceId) -> Result<u32, ManagerError> {
        let source = self.sources.get_mut(&id).ok_or(ManagerError::UnknownSource(id))?;
        Ok(source.retain())
    }

    /// Drops one reference. The last one disposes the source and all of its
    /// chunks before returning `Ok(true)`.
    pub fn release_source(&mut self, id: SourceId) -> Result<bool, ManagerError> {
        let source = self.sources.get_mut(&id).ok_or(ManagerError::UnknownSource(id))?;
        if source.release() > 0 {
            return Ok(false);
        }
        self.dispose_source(id);
        Ok(true)
    }

    pub fn source_ref_count(&self, id: SourceId) -> Option<u32> {
        self.sources.get(&id).map(ChunkSource::ref_count)
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.sources.keys().copied().collect();
        ids.sort();
        ids
    }

    fn dispose_source(&mut self, id: SourceId) {
        let positions: Vec<GridPosition> = match self.sources.get(&id) {
            Some(source) => source.chunks.keys().cloned().collect(),
            None => return,
        };
        for position in positions {
            // Every waiter holds a reference, so none can be left here.
            self.discard_chunk(&ChunkKey { source: id, position });
        }
        let Some(mut source) = self.sources.remove(&id) else {
            return;
        };
        self.by_descriptor.remove(&source.descriptor);
        let seq = source.next_seq();
        self.events.emit(OwnerMessage::SourceDisposed { source_id: id, seq });
        self.metrics.inc(SOURCES_DISPOSED);
        info!(source = %id, url = %source.descriptor.url, "source disposed");
    }

    /// Releases one source reference per finished continuation.
    fn release_continuations(&mut self, source: SourceId, count: usize) {
        for _ in 0..count {
            if !matches!(self.release_source(source), Ok(false)) {
                break;
            }
        }
    }

    // ---- chunks ----

    pub fn chunk_state(&self, key: &ChunkKey) -> Option<ChunkState> {
        self.sources
            .get(&key.source)?
            .chunks
            .get(&key.position)
            .map(Chunk::state)
    }

    /// Render-side request for one chunk in the current priority round.
    ///
    /// Idempotent: a queued chunk moves to `priority`, an in-flight one keeps
    /// its priority, a resident one is only marked as recently used. Returns
    /// the chunk's state once admission has run.
    pub fn request_chunk(
        &mut self,
        source: SourceId,
        position: impl Into<GridPosition>,
        priority: ChunkPriority,
    ) -> Result<ChunkState, ManagerError> {
        let key = ChunkKey::new(source, position);
        let state = self.register(key.clone(), priority, Interest::Round)?;
        self.pump();
        Ok(self.chunk_state(&key).unwrap_or(state))
    }

    /// A future for the decoded payload of one chunk.
    ///
    /// Resolves immediately for resident and failed chunks. Otherwise the
    /// request joins the chunk's waiters, holding a source reference until
    /// it resolves or is withdrawn. A queued chunk is raised to `priority`
    /// but never lowered.
    pub fn fetch_chunk(
        &mut self,
        source: SourceId,
        position: impl Into<GridPosition>,
        priority: ChunkPriority,
    ) -> Result<ChunkRequest, ManagerError> {
        let key = ChunkKey::new(source, position);
        self.register(key.clone(), priority, Interest::Waiter)?;

        let src = self
            .sources
            .get_mut(&key.source)
            .ok_or(ManagerError::UnknownSource(key.source))?;
        let chunk = src
            .chunks
            .get_mut(&key.position)
            .ok_or_else(|| ManagerError::UnknownChunk(key.clone()))?;
        let request = match chunk.state() {
            state if state.is_usable() => {
                let result = chunk.payload().cloned().ok_or(ChunkError::Disposed);
                ChunkRequest::ready(key, result)
            }
            ChunkState::FailedPermanent => {
                let error = chunk.error().cloned().unwrap_or(ChunkError::Disposed);
                ChunkRequest::ready(key, Err(error))
            }
            _ => {
                self.next_request += 1;
                let id = RequestId(self.next_request);
                let rx = chunk.add_waiter(id);
                src.retain();
                self.requests.insert(id, key.clone());
                ChunkRequest::pending(id, key, rx)
            }
        };
        self.pump();
        Ok(request)
    }

    /// Withdraws a pending `fetch_chunk` request. Its future, if still
    /// polled, resolves with [`ChunkError::Cancelled`]. A chunk nobody else
    /// wants is cancelled and disposed.
    pub fn withdraw_request(&mut self, id: RequestId) -> bool {
        let Some(key) = self.requests.remove(&id) else {
            return false;
        };
        let generation = self.generation;
        let abandoned = match chunk_in(&mut self.sources, &key) {
            Ok(chunk) => {
                chunk.remove_waiter(id);
                chunk.state().is_pending() && !chunk.has_interest(generation)
            }
            Err(_) => false,
        };
        if abandoned {
            debug!(chunk = %key, request = id.0, "last request withdrawn");
            self.metrics.inc(CHUNKS_WITHDRAWN);
            self.discard_chunk(&key);
        }
        self.release_continuations(key.source, 1);
        self.pump();
        true
    }

    fn register(
        &mut self,
        key: ChunkKey,
        priority: ChunkPriority,
        interest: Interest,
    ) -> Result<ChunkState, ManagerError> {
        let generation = self.generation;
        let source = self
            .sources
            .get_mut(&key.source)
            .ok_or(ManagerError::UnknownSource(key.source))?;

        if let Some(chunk) = source.chunks.get_mut(&key.position) {
            if interest == Interest::Round {
                chunk.mark_requested(generation);
            }
            let state = chunk.state();
            match state {
                ChunkState::Queued => {
                    let priority = match interest {
                        Interest::Round => priority,
                        Interest::Waiter => priority.max(chunk.priority()),
                    };
                    let changed = chunk.set_priority(priority);
                    // A chunk waiting out its retry delay rejoins the queue
                    // when the timer fires.
                    if !chunk.retry_pending() {
                        self.queue.enqueue(key.clone(), priority)?;
                    }
                    if changed {
                        let seq = source.next_seq();
                        self.events.emit(OwnerMessage::PriorityChanged {
                            source_id: key.source,
                            grid_position: key.position.clone(),
                            tier: priority.tier,
                            value: priority.value,
                            seq,
                        });
                    }
                }
                ChunkState::SystemMemory | ChunkState::GpuMemory => {
                    self.cache.touch(&key).ok();
                }
                ChunkState::Downloading | ChunkState::FailedPermanent | ChunkState::Disposed => {}
            }
            return Ok(state);
        }

        if !source.spec().contains_position(&key.position) {
            return Err(ManagerError::OutOfBounds(key));
        }
        self.queue.enqueue(key.clone(), priority)?;
        let mut chunk = Chunk::new(key.clone(), self.ids.allocate(), priority);
        if interest == Interest::Round {
            chunk.mark_requested(generation);
        }
        emit_state(&mut self.events, source, &key.position, ChunkState::Queued);
        source.chunks.insert(key.position.clone(), chunk);
        self.metrics.inc(CHUNKS_CREATED);
        debug!(chunk = %key, tier = ?priority.tier, value = priority.value, "chunk queued");
        Ok(ChunkState::Queued)
    }

    /// Removes a chunk from its source, cancelling its fetch or pulling it
    /// from the queue. Waiters still attached resolve with
    /// [`ChunkError::Disposed`]; their ids are returned.
    fn discard_chunk(&mut self, key: &ChunkKey) -> Vec<RequestId> {
        if self.queue.cancel(key) {
            self.metrics.inc(FETCH_CANCELLED);
        }
        self.queue.withdraw(key);
        self.cache.remove(key);

        let Some(source) = self.sources.get_mut(&key.source) else {
            return Vec::new();
        };
        let Some(mut chunk) = source.chunks.remove(&key.position) else {
            return Vec::new();
        };
        if let Err(error) = chunk.transition(ChunkState::Disposed) {
            warn!(chunk = %key, %error, "disposing chunk");
        }
        let orphaned = chunk.dispose();
        emit_state(&mut self.events, source, &key.position, ChunkState::Disposed);
        self.metrics.inc(CHUNKS_DISPOSED);
        debug!(chunk = %key, "chunk disposed");
        for id in &orphaned {
            self.requests.remove(id);
        }
        orphaned
    }

    fn evict(&mut self, key: &ChunkKey) {
        let orphaned = self.discard_chunk(key);
        self.metrics.inc(CHUNKS_EVICTED);
        self.release_continuations(key.source, orphaned.len());
    }

    /// Disposes a resident or failed chunk. A pinned chunk goes when its
    /// last pin is released; returns whether it is gone now.
    pub fn evict_chunk(&mut self, key: &ChunkKey) -> Result<bool, ManagerError> {
        let chunk = chunk_in(&mut self.sources, key)?;
        let state = chunk.state();
        if state.is_pending() {
            return Err(ManagerError::NotResident {
                key: key.clone(),
                state,
            });
        }
        if chunk.pins() > 0 {
            chunk.defer_eviction();
            return Ok(false);
        }
        self.evict(key);
        Ok(true)
    }

    /// Pins a resident chunk so the memory budget cannot evict it, and
    /// returns its payload.
    pub fn acquire_chunk(&mut self, key: &ChunkKey) -> Result<Arc<ChunkPayload>, ManagerError> {
        let chunk = chunk_in(&mut self.sources, key)?;
        let state = chunk.state();
        let payload = match chunk.payload() {
            Some(payload) if state.is_usable() => payload.clone(),
            _ => {
                return Err(ManagerError::NotResident {
                    key: key.clone(),
                    state,
                });
            }
        };
        self.cache.pin(key)?;
        chunk.pin();
        Ok(payload)
    }

    /// Drops one pin. Returns whether the chunk was disposed as a result,
    /// either by a deferred eviction or by the memory budget.
    pub fn release_chunk(&mut self, key: &ChunkKey) -> Result<bool, ManagerError> {
        let chunk = chunk_in(&mut self.sources, key)?;
        if chunk.pins() == 0 {
            return Ok(false);
        }
        let deferred = chunk.unpin() == 0 && chunk.evict_when_unpinned();
        let mut evicted = self.cache.unpin(key)?;
        if deferred && !evicted.contains(key) {
            evicted.push(key.clone());
        }
        let disposed = evicted.contains(key);
        for victim in evicted {
            self.evict(&victim);
        }
        Ok(disposed)
    }

    /// The render side has uploaded the chunk.
    pub fn mark_gpu_resident(&mut self, key: &ChunkKey) -> Result<(), ManagerError> {
        let source = self
            .sources
            .get_mut(&key.source)
            .ok_or(ManagerError::UnknownSource(key.source))?;
        let chunk = source
            .chunks
            .get_mut(&key.position)
            .ok_or_else(|| ManagerError::UnknownChunk(key.clone()))?;
        chunk.transition(ChunkState::GpuMemory)?;
        emit_state(&mut self.events, source, &key.position, ChunkState::GpuMemory);
        self.cache.touch(key).ok();
        Ok(())
    }

    // ---- priority rounds ----

    /// Starts a round of render requests. Chunks not requested again before
    /// [`ChunkManager::end_priority_round`] lose their render interest.
    pub fn begin_priority_round(&mut self) -> Generation {
        self.generation = self.generation.next();
        self.generation
    }

    /// Disposes pending and failed chunks nobody asked for this round and
    /// which have no waiters or pins. Waiters whose futures were dropped are
    /// pruned first.
    pub fn end_priority_round(&mut self) {
        let generation = self.generation;
        let mut closed = Vec::new();
        let mut stale = Vec::new();
        for source in self.sources.values_mut() {
            for chunk in source.chunks.values_mut() {
                for id in chunk.prune_closed_waiters() {
                    closed.push((source.id, id));
                }
                let state = chunk.state();
                let droppable = state.is_pending() || state == ChunkState::FailedPermanent;
                if droppable && !chunk.has_interest(generation) {
                    stale.push(chunk.key().clone());
                }
            }
        }
        stale.sort();

        for (source, id) in closed {
            self.requests.remove(&id);
            self.release_continuations(source, 1);
        }
        for key in stale {
            if self.chunk_state(&key).is_some() {
                self.metrics.inc(CHUNKS_WITHDRAWN);
                self.discard_chunk(&key);
            }
        }
        self.pump();
    }

    // ---- visible layers ----

    /// Replaces what `layer` shows. A changed diagnostic is forwarded.
    pub fn set_visible_layer(
        &mut self,
        layer: LayerId,
        sources: Vec<(ViewId, VisibleSource)>,
        diagnostic: Option<String>,
    ) {
        let entry = self.layers.entry(layer).or_default();
        entry.sources = sources;
        if entry.diagnostic != diagnostic {
            entry.diagnostic = diagnostic.clone();
            self.emit_diagnostic(layer, diagnostic);
        }
        self.recompute_priorities();
    }

    pub fn remove_visible_layer(&mut self, layer: LayerId) -> bool {
        let Some(removed) = self.layers.remove(&layer) else {
            return false;
        };
        if removed.diagnostic.is_some() {
            self.emit_diagnostic(layer, None);
        }
        self.recompute_priorities();
        true
    }

    pub fn update_view(&mut self, view_id: ViewId, view: ViewSpec) {
        self.views.insert(view_id, view);
        self.recompute_priorities();
    }

    pub fn remove_view(&mut self, view_id: ViewId) -> bool {
        let removed = self.views.remove(&view_id).is_some();
        if removed {
            self.recompute_priorities();
        }
        removed
    }

    fn emit_diagnostic(&mut self, layer: LayerId, message: Option<String>) {
        if let Some(message) = &message {
            warn!(%layer, %message, "layer diagnostic");
        }
        let seq = self.layer_seqs.entry(layer).or_default();
        *seq += 1;
        let seq = *seq;
        self.events.emit(OwnerMessage::LayerDiagnostic {
            layer_id: layer,
            message,
            seq,
        });
    }

    /// Runs one priority round over every (layer, view) pair. A chunk seen
    /// by several views keeps its best priority. Chunks are registered best
    /// first, so a full queue turns away the least urgent ones.
    pub fn recompute_priorities(&mut self) {
        let mut wanted: HashMap<ChunkKey, ChunkPriority> = HashMap::new();
        for layer in self.layers.values() {
            for (view_id, visible) in &layer.sources {
                let Some(view) = self.views.get(view_id) else {
                    continue;
                };
                for chunk in visible_chunks(visible, view) {
                    let key = ChunkKey {
                        source: chunk.source,
                        position: chunk.position,
                    };
                    wanted
                        .entry(key)
                        .and_modify(|p| *p = (*p).max(chunk.priority))
                        .or_insert(chunk.priority);
                }
            }
        }
        let mut ordered: Vec<(ChunkKey, ChunkPriority)> = wanted.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let generation = self.begin_priority_round();
        let mut rejected = 0u64;
        for (key, priority) in ordered {
            match self.register(key, priority, Interest::Round) {
                Ok(_) => {}
                Err(ManagerError::QueueFull(_)) => rejected += 1,
                Err(error) => debug!(%error, "skipping visible chunk"),
            }
        }
        if rejected > 0 {
            self.metrics.inc_by(QUEUE_REJECTED, rejected);
            warn!(rejected, generation = generation.0, "queue full, visible chunks turned away");
        }
        self.end_priority_round();
    }

    /// Applies one consumer message.
    pub fn apply_consumer_message(&mut self, message: ConsumerMessage) {
        match message {
            ConsumerMessage::AddVisibleLayer {
                layer_id,
                sources,
                diagnostic,
            } => {
                let mut diagnostic = diagnostic;
                let mut visible = Vec::with_capacity(sources.len());
                for wire in sources {
                    match wire.into_visible() {
                        Ok(source) => visible.push(source),
                        Err(error) => {
                            diagnostic.get_or_insert_with(|| {
                                format!("invalid source transform: {error}")
                            });
                        }
                    }
                }
                if diagnostic.is_some() {
                    visible.clear();
                }
                self.set_visible_layer(layer_id, visible, diagnostic);
            }
            ConsumerMessage::RemoveVisibleLayer { layer_id } => {
                self.remove_visible_layer(layer_id);
            }
            ConsumerMessage::UpdateView { view_id, view } => self.update_view(view_id, view),
            ConsumerMessage::RemoveView { view_id } => {
                self.remove_view(view_id);
            }
            ConsumerMessage::RequestSnapshot => {
                let snapshot = self.snapshot();
                self.events.emit(OwnerMessage::Snapshot(snapshot));
            }
        }
    }

    // ---- admission and fetch outcomes ----

    fn pump(&mut self) {
        while let Some((key, priority)) = self.queue.next_admission() {
            let Some(source) = self.sources.get_mut(&key.source) else {
                self.queue.abandon_admission();
                continue;
            };
            let Some(chunk) = source.chunks.get_mut(&key.position) else {
                self.queue.abandon_admission();
                continue;
            };
            if let Err(error) = chunk.transition(ChunkState::Downloading) {
                warn!(chunk = %key, %error, "queued chunk cannot start");
                self.queue.abandon_admission();
                continue;
            }
            let attempt = chunk.begin_attempt();
            let instance = chunk.instance();
            let cancel = CancellationToken::new();
            let request = FetchRequest {
                source: key.source,
                descriptor: source.descriptor.clone(),
                position: key.position.clone(),
                attempt,
                cancel: cancel.clone(),
            };
            let task = FetchTask {
                tx: self.outcomes_tx.clone(),
                key: key.clone(),
                instance,
                data_source: source.data_source.clone(),
                format: source.format.clone(),
                target: source.spec().decode_target(&key.position),
            };
            emit_state(&mut self.events, source, &key.position, ChunkState::Downloading);
            self.queue.start(
                key.clone(),
                InFlight {
                    instance,
                    attempt,
                    cancel,
                },
            );
            self.metrics.inc(FETCH_STARTED);
            debug!(chunk = %key, attempt, tier = ?priority.tier, "fetch started");
            task.spawn(request);
        }
        self.update_gauges();
    }

    fn update_gauges(&mut self) {
        self.metrics.set_gauge(QUEUE_LEN, self.queue.queued_len() as i64);
        self.metrics.set_gauge(IN_FLIGHT, self.queue.in_flight_len() as i64);
    }

    pub fn queued_len(&self) -> usize {
        self.queue.queued_len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.queue.in_flight_len()
    }

    /// Nothing queued, in flight or waiting out a retry delay.
    pub fn is_idle(&self) -> bool {
        self.queue.queued_len() == 0
            && self.queue.in_flight_len() == 0
            && !self
                .sources
                .values()
                .flat_map(|s| s.chunks.values())
                .any(Chunk::retry_pending)
    }

    /// Waits for the next fetch or retry report. Never returns `None` while
    /// the manager is alive.
    pub async fn next_outcome(&mut self) -> Option<FetchOutcome> {
        self.outcomes_rx.recv().await
    }

    /// Applies every report that has already arrived; returns how many.
    pub fn process_ready(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            self.handle_outcome(outcome);
            handled += 1;
        }
        handled
    }

    /// Handles reports until [`ChunkManager::is_idle`]. Hangs if a fetch
    /// never completes.
    pub async fn run_until_idle(&mut self) {
        while !self.is_idle() {
            let Some(outcome) = self.outcomes_rx.recv().await else {
                return;
            };
            self.handle_outcome(outcome);
        }
    }

    pub fn handle_outcome(&mut self, outcome: FetchOutcome) {
        match outcome.0 {
            Outcome::Fetched {
                key,
                instance,
                attempt,
                result,
            } => self.finish_fetch(key, instance, attempt, result),
            Outcome::RetryDue { key, instance } => self.retry_due(key, instance),
        }
        self.pump();
    }

    fn finish_fetch(
        &mut self,
        key: ChunkKey,
        instance: ObjectId,
        attempt: u32,
        result: Result<ChunkPayload, AttemptError>,
    ) {
        if self.queue.finish(&key, instance).is_none() {
            self.metrics.inc(FETCH_STALE);
            debug!(chunk = %key, "dropping outcome of a cancelled fetch");
            return;
        }
        match result {
            Ok(payload) => self.complete(key, payload),
            Err(AttemptError::Fetch(error))
                if error.is_retryable() && self.queue.retry_policy().should_retry(attempt) =>
            {
                self.schedule_retry(key, instance, attempt, error)
            }
            Err(AttemptError::Fetch(error)) if error.is_retryable() => self.fail(
                key,
                ChunkError::RetriesExhausted {
                    attempts: attempt,
                    last: error,
                },
            ),
            Err(AttemptError::Fetch(error)) => self.fail(key, ChunkError::Fetch(error)),
            Err(AttemptError::Decode(error)) => self.fail(key, ChunkError::Decode(error)),
        }
    }

    fn complete(&mut self, key: ChunkKey, payload: ChunkPayload) {
        let Some(source) = self.sources.get_mut(&key.source) else {
            return;
        };
        let Some(chunk) = source.chunks.get_mut(&key.position) else {
            return;
        };
        if let Err(error) = chunk.transition(ChunkState::SystemMemory) {
            warn!(chunk = %key, %error, "fetched chunk cannot become resident");
            return;
        }
        let bytes = source.format.size_in_bytes(&payload);
        let resolved = chunk.resolve(Arc::new(payload));
        emit_state(&mut self.events, source, &key.position, ChunkState::SystemMemory);
        self.metrics.inc(FETCH_COMPLETED);
        self.metrics
            .record(CHUNK_BYTES, i64::try_from(bytes).unwrap_or(i64::MAX));
        debug!(chunk = %key, bytes, waiters = resolved.len(), "chunk resident");
        for id in &resolved {
            self.requests.remove(id);
        }

        match self.cache.mark_resident(&key, bytes) {
            Ok(evicted) => {
                for victim in evicted {
                    self.evict(&victim);
                }
            }
            Err(error) => {
                // Waiters already have the payload; it just cannot stay.
                warn!(chunk = %key, %error, "chunk does not fit the memory budget");
                self.evict(&key);
            }
        }
        self.release_continuations(key.source, resolved.len());
    }

    fn schedule_retry(
        &mut self,
        key: ChunkKey,
        instance: ObjectId,
        attempt: u32,
        error: FetchError,
    ) {
        let Some(source) = self.sources.get_mut(&key.source) else {
            return;
        };
        let Some(chunk) = source.chunks.get_mut(&key.position) else {
            return;
        };
        if let Err(transition) = chunk.transition(ChunkState::Queued) {
            warn!(chunk = %key, error = %transition, "cannot schedule retry");
            return;
        }
        chunk.set_retry_pending(true);
        emit_state(&mut self.events, source, &key.position, ChunkState::Queued);

        let delay = self.queue.retry_policy().delay(attempt.saturating_sub(1));
        self.metrics.inc(FETCH_RETRIES);
        warn!(chunk = %key, attempt, ?delay, %error, "transient fetch failure, retrying");

        let tx = self.outcomes_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(FetchOutcome(Outcome::RetryDue { key, instance }));
        });
    }

    fn retry_due(&mut self, key: ChunkKey, instance: ObjectId) {
        let Ok(chunk) = chunk_in(&mut self.sources, &key) else {
            return;
        };
        if chunk.instance() != instance || !chunk.retry_pending() {
            return;
        }
        chunk.set_retry_pending(false);
        let priority = chunk.priority();
        self.queue.requeue(key, priority);
    }

    fn fail(&mut self, key: ChunkKey, error: ChunkError) {
        let Some(source) = self.sources.get_mut(&key.source) else {
            return;
        };
        let Some(chunk) = source.chunks.get_mut(&key.position) else {
            return;
        };
        if let Err(transition) = chunk.transition(ChunkState::FailedPermanent) {
            warn!(chunk = %key, error = %transition, "cannot mark chunk failed");
            return;
        }
        let rejected = chunk.fail(error.clone());
        emit_state(&mut self.events, source, &key.position, ChunkState::FailedPermanent);
        self.metrics.inc(FETCH_FAILED);
        warn!(chunk = %key, %error, waiters = rejected.len(), "chunk failed permanently");
        for id in &rejected {
            self.requests.remove(id);
        }
        self.release_continuations(key.source, rejected.len());
    }

    // ---- reporting ----

    /// Full state for rebuilding a mirror.
    pub fn snapshot(&self) -> Snapshot {
        let sources = self
            .source_ids()
            .into_iter()
            .filter_map(|id| self.sources.get(&id))
            .map(|source| {
                let mut chunks: Vec<ChunkSnapshot> = source
                    .chunks
                    .iter()
                    .map(|(position, chunk)| ChunkSnapshot {
                        grid_position: position.clone(),
                        state: chunk.state(),
                        tier: chunk.priority().tier,
                        value: chunk.priority().value,
                    })
                    .collect();
                chunks.sort_by(|a, b| a.grid_position.cmp(&b.grid_position));
                SourceSnapshot {
                    source_id: source.id,
                    seq: source.seq(),
                    chunks,
                }
            })
            .collect();
        let layers = self
            .layers
            .iter()
            .map(|(&layer_id, layer)| LayerSnapshot {
                layer_id,
                seq: self.layer_seqs.get(&layer_id).copied().unwrap_or(0),
                diagnostic: layer.diagnostic.clone(),
            })
            .collect();
        Snapshot { sources, layers }
    }

    /// Takes every owner message emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<OwnerMessage> {
        self.events.drain()
    }

    /// Live copy of owner messages as they are emitted.
    pub fn subscribe(&mut self) -> broadcast::Receiver<OwnerMessage> {
        self.events.subscribe()
    }
}

impl SourceRefs for ChunkManager {
    fn retain_source(&mut self, source: SourceId) {
        if let Err(error) = ChunkManager::retain_source(self, source) {
            warn!(%error, "cannot retain source");
        }
    }

    fn release_source(&mut self, source: SourceId) {
        if let Err(error) = ChunkManager::release_source(self, source) {
            warn!(%error, "cannot release source");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use foundation::math::Affine;

    use super::{
        CHUNKS_EVICTED, ChunkManager, FETCH_CANCELLED, FETCH_RETRIES, IN_FLIGHT, ManagerError,
    };
    use crate::config::StreamingConfig;
    use crate::fetch::{ChunkError, FetchError, FetchErrorKind};
    use crate::protocol::{ConsumerMessage, OwnerMessage, WireVisibleSource};
    use crate::request::{ChunkKey, ChunkPriority, GridPosition, LayerId, SourceId, ViewId};
    use crate::residency::ChunkState;
    use crate::selection::{ViewSpec, VisibleSource};
    use crate::testing::{Reply, ScriptedSource, cube_spec, descriptor};
    use crate::transform::{LayerTransform, compute_source_transform};

    fn pos(coords: [i64; 3]) -> GridPosition {
        GridPosition::new(coords.to_vec())
    }

    fn visible(value: f64) -> ChunkPriority {
        ChunkPriority::visible(value)
    }

    fn manager(scripted: &ScriptedSource, config: StreamingConfig) -> (ChunkManager, SourceId) {
        let mut mgr = ChunkManager::new(config, scripted.registry()).unwrap();
        // 4x4x4 grid of 4³ chunks, 64 bytes each.
        let src = mgr
            .acquire_source(descriptor("scripted://volume", cube_spec(4, 16)))
            .unwrap();
        (mgr, src)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn coalesced_requests_share_one_fetch_and_payload() {
        let scripted = ScriptedSource::gated();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());

        let a = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        let b = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        assert!(!a.is_ready());
        assert_eq!(mgr.source_ref_count(src), Some(3));

        scripted.release(1);
        mgr.run_until_idle().await;
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.num_elements(), 64);
        assert_eq!(scripted.fetches().len(), 1);
        assert_eq!(mgr.source_ref_count(src), Some(1));

        // Resident now: answered without another fetch.
        let again = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        assert!(again.is_ready());
        assert!(Arc::ptr_eq(&again.await.unwrap(), &a));
        assert_eq!(scripted.fetches().len(), 1);
    }

    #[tokio::test]
    async fn in_flight_fetches_never_exceed_the_bound() {
        let scripted = ScriptedSource::gated();
        let config = StreamingConfig {
            max_inflight: 2,
            ..StreamingConfig::default()
        };
        let (mut mgr, src) = manager(&scripted, config);

        let requests: Vec<_> = (0..4)
            .map(|x| mgr.fetch_chunk(src, pos([x, 0, 0]), visible(0.0)).unwrap())
            .collect();
        settle().await;
        assert_eq!(scripted.in_flight(), 2);
        assert_eq!(mgr.in_flight_len(), 2);
        assert_eq!(mgr.queued_len(), 2);

        scripted.release(4);
        mgr.run_until_idle().await;
        for request in requests {
            assert!(request.await.is_ok());
        }
        assert_eq!(scripted.peak_in_flight(), 2);
        assert_eq!(mgr.metrics().gauge(IN_FLIGHT).unwrap().peak, 2);
    }

    #[tokio::test]
    async fn higher_priority_is_admitted_first() {
        let scripted = ScriptedSource::gated();
        let config = StreamingConfig {
            max_inflight: 1,
            ..StreamingConfig::default()
        };
        let (mut mgr, src) = manager(&scripted, config);

        assert_eq!(
            mgr.request_chunk(src, pos([2, 0, 0]), visible(0.0)).unwrap(),
            ChunkState::Downloading
        );
        mgr.request_chunk(src, pos([0, 0, 0]), visible(-5.0)).unwrap();
        mgr.request_chunk(src, pos([1, 0, 0]), visible(-1.0)).unwrap();
        mgr.request_chunk(src, pos([3, 0, 0]), ChunkPriority::prefetch(100.0)).unwrap();

        scripted.release(4);
        mgr.run_until_idle().await;
        assert_eq!(
            scripted.positions(),
            vec![pos([2, 0, 0]), pos([1, 0, 0]), pos([0, 0, 0]), pos([3, 0, 0])]
        );
    }

    #[tokio::test]
    async fn reprioritised_queued_chunk_moves_ahead() {
        let scripted = ScriptedSource::gated();
        let config = StreamingConfig {
            max_inflight: 1,
            ..StreamingConfig::default()
        };
        let (mut mgr, src) = manager(&scripted, config);

        mgr.request_chunk(src, pos([3, 3, 3]), visible(0.0)).unwrap();
        mgr.request_chunk(src, pos([0, 0, 0]), visible(-9.0)).unwrap();
        mgr.request_chunk(src, pos([1, 0, 0]), visible(-1.0)).unwrap();
        mgr.drain_events();
        mgr.request_chunk(src, pos([0, 0, 0]), visible(5.0)).unwrap();
        assert!(matches!(
            mgr.drain_events().as_slice(),
            [OwnerMessage::PriorityChanged { value, .. }] if *value == 5.0
        ));

        scripted.release(3);
        mgr.run_until_idle().await;
        assert_eq!(
            scripted.positions(),
            vec![pos([3, 3, 3]), pos([0, 0, 0]), pos([1, 0, 0])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff() {
        let scripted = ScriptedSource::new();
        scripted
            .reply(pos([0, 0, 0]), Reply::Fail(FetchError::transient("503")))
            .reply(pos([0, 0, 0]), Reply::Fail(FetchError::transient("503")));
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());

        let start = tokio::time::Instant::now();
        let request = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        mgr.run_until_idle().await;
        assert!(request.await.is_ok());

        // Two retries: [100, 200) + [200, 400) ms.
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(600),
            "{elapsed:?}"
        );
        let attempts: Vec<u32> = scripted.fetches().iter().map(|f| f.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(mgr.metrics().counter(FETCH_RETRIES), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_permanently() {
        let scripted = ScriptedSource::new();
        for _ in 0..2 {
            scripted.reply(pos([0, 0, 0]), Reply::Fail(FetchError::transient("timeout")));
        }
        let config = StreamingConfig {
            max_attempts: 2,
            ..StreamingConfig::default()
        };
        let (mut mgr, src) = manager(&scripted, config);

        let request = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        mgr.run_until_idle().await;
        assert!(matches!(
            request.await,
            Err(ChunkError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(scripted.fetches().len(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_reported_to_later_requests() {
        let scripted = ScriptedSource::new();
        scripted.reply(pos([0, 0, 0]), Reply::Fail(FetchError::not_found("no such chunk")));
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());

        let first = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        mgr.run_until_idle().await;
        let key = ChunkKey::new(src, pos([0, 0, 0]));
        assert_eq!(mgr.chunk_state(&key), Some(ChunkState::FailedPermanent));
        assert!(matches!(
            first.await,
            Err(ChunkError::Fetch(e)) if e.kind == FetchErrorKind::NotFound
        ));

        let later = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        assert!(later.is_ready());
        assert!(matches!(later.await, Err(ChunkError::Fetch(_))));
        assert_eq!(scripted.fetches().len(), 1);
        assert_eq!(mgr.source_ref_count(src), Some(1));
    }

    #[tokio::test]
    async fn undecodable_bytes_are_a_permanent_error() {
        let scripted = ScriptedSource::new();
        scripted.reply(pos([0, 0, 0]), Reply::Bytes(vec![0; 3]));
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());

        let request = mgr.fetch_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        mgr.run_until_idle().await;
        assert!(matches!(request.await, Err(ChunkError::Decode(_))));
    }

    #[tokio::test]
    async fn withdrawing_the_last_request_cancels_the_fetch() {
        let scripted = ScriptedSource::gated();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        let key = ChunkKey::new(src, pos([1, 1, 1]));

        let request = mgr.fetch_chunk(src, key.position.clone(), visible(0.0)).unwrap();
        settle().await;
        assert_eq!(scripted.in_flight(), 1);

        assert!(mgr.withdraw_request(request.id().unwrap()));
        assert!(matches!(request.await, Err(ChunkError::Cancelled)));
        assert_eq!(mgr.chunk_state(&key), None);
        assert_eq!(mgr.in_flight_len(), 0);
        assert_eq!(mgr.metrics().counter(FETCH_CANCELLED), 1);
        assert_eq!(mgr.source_ref_count(src), Some(1));

        settle().await;
        assert_eq!(scripted.in_flight(), 0);
    }

    #[tokio::test]
    async fn out_of_grid_requests_are_rejected() {
        let scripted = ScriptedSource::new();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        assert!(matches!(
            mgr.request_chunk(src, pos([4, 0, 0]), visible(0.0)),
            Err(ManagerError::OutOfBounds(_))
        ));
        assert!(matches!(
            mgr.request_chunk(SourceId(999), pos([0, 0, 0]), visible(0.0)),
            Err(ManagerError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn equal_descriptors_share_a_source_disposed_once() {
        let scripted = ScriptedSource::new();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        let again = mgr
            .acquire_source(descriptor("scripted://volume", cube_spec(4, 16)))
            .unwrap();
        assert_eq!(again, src);
        assert_eq!(mgr.source_ref_count(src), Some(2));

        mgr.request_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        mgr.run_until_idle().await;
        mgr.drain_events();

        assert_eq!(mgr.release_source(src), Ok(false));
        assert_eq!(mgr.release_source(src), Ok(true));
        let disposed = mgr
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, OwnerMessage::SourceDisposed { .. }))
            .count();
        assert_eq!(disposed, 1);
        assert_eq!(mgr.release_source(src), Err(ManagerError::UnknownSource(src)));
        assert!(mgr.source_ids().is_empty());
    }

    #[tokio::test]
    async fn chunks_skipped_by_a_round_are_dropped() {
        let scripted = ScriptedSource::gated();
        let config = StreamingConfig {
            max_inflight: 1,
            ..StreamingConfig::default()
        };
        let (mut mgr, src) = manager(&scripted, config);
        let a = ChunkKey::new(src, pos([0, 0, 0]));
        let b = ChunkKey::new(src, pos([1, 0, 0]));

        mgr.begin_priority_round();
        mgr.request_chunk(src, a.position.clone(), visible(1.0)).unwrap();
        mgr.request_chunk(src, b.position.clone(), visible(0.0)).unwrap();
        mgr.end_priority_round();
        assert_eq!(mgr.chunk_state(&a), Some(ChunkState::Downloading));
        assert_eq!(mgr.chunk_state(&b), Some(ChunkState::Queued));

        mgr.begin_priority_round();
        mgr.request_chunk(src, b.position.clone(), visible(0.0)).unwrap();
        mgr.end_priority_round();
        assert_eq!(mgr.chunk_state(&a), None);
        assert_eq!(mgr.chunk_state(&b), Some(ChunkState::Downloading));
        assert_eq!(mgr.metrics().counter(FETCH_CANCELLED), 1);
    }

    #[tokio::test]
    async fn failed_chunk_requeues_after_disposal() {
        let scripted = ScriptedSource::new();
        scripted.reply(pos([0, 0, 0]), Reply::Fail(FetchError::permanent("403")));
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        let key = ChunkKey::new(src, pos([0, 0, 0]));

        mgr.request_chunk(src, key.position.clone(), visible(0.0)).unwrap();
        mgr.run_until_idle().await;
        assert_eq!(mgr.chunk_state(&key), Some(ChunkState::FailedPermanent));

        // Still wanted: stays failed, no new fetch.
        mgr.begin_priority_round();
        mgr.request_chunk(src, key.position.clone(), visible(0.0)).unwrap();
        mgr.end_priority_round();
        assert_eq!(mgr.chunk_state(&key), Some(ChunkState::FailedPermanent));
        assert_eq!(scripted.fetches().len(), 1);

        mgr.begin_priority_round();
        mgr.end_priority_round();
        assert_eq!(mgr.chunk_state(&key), None);

        mgr.drain_events();
        mgr.request_chunk(src, key.position.clone(), visible(0.0)).unwrap();
        let events = mgr.drain_events();
        assert!(matches!(
            events.first(),
            Some(OwnerMessage::ChunkStateChanged { new_state: ChunkState::Queued, .. })
        ));
        mgr.run_until_idle().await;
        assert_eq!(mgr.chunk_state(&key), Some(ChunkState::SystemMemory));
    }

    #[tokio::test]
    async fn memory_budget_evicts_least_recently_used() {
        let scripted = ScriptedSource::new();
        let config = StreamingConfig {
            system_memory_bytes: 128,
            ..StreamingConfig::default()
        };
        let (mut mgr, src) = manager(&scripted, config);

        for x in 0..3 {
            mgr.request_chunk(src, pos([x, 0, 0]), visible(0.0)).unwrap();
            mgr.run_until_idle().await;
        }
        assert_eq!(mgr.chunk_state(&ChunkKey::new(src, pos([0, 0, 0]))), None);
        assert_eq!(
            mgr.chunk_state(&ChunkKey::new(src, pos([2, 0, 0]))),
            Some(ChunkState::SystemMemory)
        );
        assert_eq!(mgr.metrics().counter(CHUNKS_EVICTED), 1);
    }

    #[tokio::test]
    async fn eviction_of_a_pinned_chunk_waits_for_release() {
        let scripted = ScriptedSource::new();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        let key = ChunkKey::new(src, pos([0, 0, 0]));
        mgr.request_chunk(src, key.position.clone(), visible(0.0)).unwrap();
        mgr.run_until_idle().await;

        let payload = mgr.acquire_chunk(&key).unwrap();
        assert_eq!(payload.num_elements(), 64);
        assert_eq!(mgr.evict_chunk(&key), Ok(false));
        assert_eq!(mgr.chunk_state(&key), Some(ChunkState::SystemMemory));

        assert_eq!(mgr.release_chunk(&key), Ok(true));
        assert_eq!(mgr.chunk_state(&key), None);
    }

    #[tokio::test]
    async fn gpu_residency_is_forward_only() {
        let scripted = ScriptedSource::new();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        let key = ChunkKey::new(src, pos([0, 0, 0]));
        mgr.request_chunk(src, key.position.clone(), visible(0.0)).unwrap();
        mgr.run_until_idle().await;

        mgr.mark_gpu_resident(&key).unwrap();
        assert_eq!(mgr.chunk_state(&key), Some(ChunkState::GpuMemory));
        assert!(matches!(
            mgr.mark_gpu_resident(&key),
            Err(ManagerError::Transition(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_lists_chunks_with_current_sequence() {
        let scripted = ScriptedSource::new();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        mgr.request_chunk(src, pos([1, 0, 0]), visible(0.0)).unwrap();
        mgr.request_chunk(src, pos([0, 0, 0]), visible(0.0)).unwrap();
        mgr.run_until_idle().await;

        let snapshot = mgr.snapshot();
        assert_eq!(snapshot.sources.len(), 1);
        let source = &snapshot.sources[0];
        assert_eq!(source.source_id, src);
        // Queued, Downloading and SystemMemory for each chunk.
        assert_eq!(source.seq, 6);
        let positions: Vec<_> = source.chunks.iter().map(|c| c.grid_position.clone()).collect();
        assert_eq!(positions, vec![pos([0, 0, 0]), pos([1, 0, 0])]);
        assert!(source.chunks.iter().all(|c| c.state == ChunkState::SystemMemory));
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawing_during_retry_delay_disposes_the_chunk() {
        let scripted = ScriptedSource::new();
        scripted.reply(pos([0, 0, 0]), Reply::Fail(FetchError::transient("503")));
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        let key = ChunkKey::new(src, pos([0, 0, 0]));

        let request = mgr.fetch_chunk(src, key.position.clone(), visible(0.0)).unwrap();
        let failed = mgr.next_outcome().await.unwrap();
        mgr.handle_outcome(failed);
        assert_eq!(mgr.chunk_state(&key), Some(ChunkState::Queued));
        assert_eq!(mgr.queued_len(), 0);
        assert!(!mgr.is_idle());

        mgr.drain_events();
        assert!(mgr.withdraw_request(request.id().unwrap()));
        assert_eq!(mgr.chunk_state(&key), None);
        assert!(matches!(
            mgr.drain_events().as_slice(),
            [OwnerMessage::ChunkStateChanged { new_state: ChunkState::Disposed, .. }]
        ));
        assert!(mgr.is_idle());
        assert_eq!(mgr.source_ref_count(src), Some(1));

        // The timer still fires but finds nothing to requeue.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mgr.process_ready(), 1);
        assert_eq!(mgr.queued_len(), 0);
        assert!(mgr.drain_events().is_empty());
        assert_eq!(scripted.fetches().len(), 1);
        assert!(matches!(request.await, Err(ChunkError::Cancelled)));
    }

    #[tokio::test]
    async fn memory_budget_disposes_gpu_resident_chunks() {
        let scripted = ScriptedSource::new();
        let config = StreamingConfig {
            system_memory_bytes: 128,
            ..StreamingConfig::default()
        };
        let (mut mgr, src) = manager(&scripted, config);
        let uploaded = ChunkKey::new(src, pos([0, 0, 0]));

        mgr.request_chunk(src, uploaded.position.clone(), visible(0.0)).unwrap();
        mgr.run_until_idle().await;
        mgr.mark_gpu_resident(&uploaded).unwrap();
        for x in 1..3 {
            mgr.request_chunk(src, pos([x, 0, 0]), visible(0.0)).unwrap();
            mgr.run_until_idle().await;
        }

        assert_eq!(mgr.chunk_state(&uploaded), None);
        let disposed: Vec<GridPosition> = mgr
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                OwnerMessage::ChunkStateChanged {
                    grid_position,
                    new_state: ChunkState::Disposed,
                    ..
                } => Some(grid_position),
                _ => None,
            })
            .collect();
        assert_eq!(disposed, vec![uploaded.position.clone()]);
        assert_eq!(mgr.metrics().counter(CHUNKS_EVICTED), 1);

        // Coming back means a new chunk starting from Queued.
        mgr.request_chunk(src, uploaded.position.clone(), visible(0.0)).unwrap();
        assert!(matches!(
            mgr.drain_events().first(),
            Some(OwnerMessage::ChunkStateChanged { new_state: ChunkState::Queued, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_wire_source_becomes_one_diagnostic() {
        let scripted = ScriptedSource::new();
        let (mut mgr, src) = manager(&scripted, StreamingConfig::default());
        let transform = compute_source_transform(
            src,
            &cube_spec(4, 16),
            &Affine::identity(3),
            3,
            &[],
            &LayerTransform::identity(3),
        )
        .unwrap();
        let mut wire = WireVisibleSource::new(
            ViewId(1),
            &VisibleSource {
                transform,
                scale_offset: 0,
            },
        );
        wire.chunk_data_size = vec![0, 4, 4];
        let add = ConsumerMessage::AddVisibleLayer {
            layer_id: LayerId(1),
            sources: vec![wire],
            diagnostic: None,
        };

        mgr.apply_consumer_message(add.clone());
        mgr.apply_consumer_message(ConsumerMessage::UpdateView {
            view_id: ViewId(1),
            view: ViewSpec::centered(vec![0, 1, 2], vec![8.0; 3], [8.0; 3], 1.0),
        });
        mgr.apply_consumer_message(add);
        settle().await;

        let events = mgr.drain_events();
        let diagnostics: Vec<&OwnerMessage> = events
            .iter()
            .filter(|e| matches!(e, OwnerMessage::LayerDiagnostic { .. }))
            .collect();
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(
            diagnostics[0],
            OwnerMessage::LayerDiagnostic { message: Some(m), .. } if m.contains("chunk size")
        ));
        assert!(!events.iter().any(|e| matches!(e, OwnerMessage::ChunkStateChanged { .. })));
        assert!(scripted.fetches().is_empty());
        assert!(mgr.is_idle());
    }
}
