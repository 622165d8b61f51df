use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use foundation::ObjectId;
use runtime::Generation;
use tokio::sync::oneshot;
use tracing::trace;

use crate::fetch::ChunkError;
use crate::payload::ChunkPayload;
use crate::request::{ChunkKey, ChunkPriority, RequestId};
use crate::residency::{ChunkState, Residency, TransitionError};

pub type ChunkResult = Result<Arc<ChunkPayload>, ChunkError>;

pub(crate) struct Waiter {
    pub(crate) id: RequestId,
    tx: oneshot::Sender<ChunkResult>,
}

/// Owner-side record for one chunk of one source.
///
/// `instance` is unique per chunk object. A chunk that is disposed and later
/// requested again gets a fresh instance, so fetch results addressed to the
/// old one are recognised as stale.
#[derive(Debug)]
pub(crate) struct Chunk {
    key: ChunkKey,
    instance: ObjectId,
    residency: Residency,
    priority: ChunkPriority,
    /// Last priority round that asked for this chunk. `None` when only
    /// `fetch_chunk` callers are interested.
    requested_in: Option<Generation>,
    payload: Option<Arc<ChunkPayload>>,
    error: Option<ChunkError>,
    attempts: u32,
    retry_pending: bool,
    waiters: Vec<Waiter>,
    pins: u32,
    evict_when_unpinned: bool,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Waiter").field(&self.id).finish()
    }
}

impl Chunk {
    pub(crate) fn new(key: ChunkKey, instance: ObjectId, priority: ChunkPriority) -> Self {
        Self {
            key,
            instance,
            residency: Residency::new(),
            priority,
            requested_in: None,
            payload: None,
            error: None,
            attempts: 0,
            retry_pending: false,
            waiters: Vec::new(),
            pins: 0,
            evict_when_unpinned: false,
        }
    }

    pub(crate) fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub(crate) fn instance(&self) -> ObjectId {
        self.instance
    }

    pub(crate) fn state(&self) -> ChunkState {
        self.residency.state()
    }

    pub(crate) fn priority(&self) -> ChunkPriority {
        self.priority
    }

    /// Returns whether the priority changed.
    pub(crate) fn set_priority(&mut self, priority: ChunkPriority) -> bool {
        let changed = self.priority != priority;
        self.priority = priority;
        changed
    }

    pub(crate) fn payload(&self) -> Option<&Arc<ChunkPayload>> {
        self.payload.as_ref()
    }

    pub(crate) fn error(&self) -> Option<&ChunkError> {
        self.error.as_ref()
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub(crate) fn set_retry_pending(&mut self, pending: bool) {
        self.retry_pending = pending;
    }

    pub(crate) fn mark_requested(&mut self, generation: Generation) {
        self.requested_in = Some(generation);
    }

    /// Anyone still wants this chunk as of `generation`.
    pub(crate) fn has_interest(&self, generation: Generation) -> bool {
        !self.waiters.is_empty() || self.pins > 0 || self.requested_in == Some(generation)
    }

    pub(crate) fn transition(&mut self, to: ChunkState) -> Result<(), TransitionError> {
        let from = self.residency.advance(to)?;
        trace!(chunk = %self.key, ?from, ?to, "chunk transition");
        Ok(())
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn add_waiter(&mut self, id: RequestId) -> oneshot::Receiver<ChunkResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter { id, tx });
        rx
    }

    /// Drops one waiter without resolving it. Returns whether it was found.
    pub(crate) fn remove_waiter(&mut self, id: RequestId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        self.waiters.len() != before
    }

    /// Drops waiters whose receiving side has gone away; returns their ids.
    pub(crate) fn prune_closed_waiters(&mut self) -> Vec<RequestId> {
        let mut closed = Vec::new();
        self.waiters.retain(|w| {
            let open = !w.tx.is_closed();
            if !open {
                closed.push(w.id);
            }
            open
        });
        closed
    }

    /// Resolves every waiter, in registration order, with clones of `result`.
    /// Returns the ids that were resolved.
    fn notify(&mut self, result: ChunkResult) -> Vec<RequestId> {
        let waiters = std::mem::take(&mut self.waiters);
        waiters
            .into_iter()
            .map(|w| {
                // The requester may have dropped its future; nothing to deliver then.
                let _ = w.tx.send(result.clone());
                w.id
            })
            .collect()
    }

    pub(crate) fn resolve(&mut self, payload: Arc<ChunkPayload>) -> Vec<RequestId> {
        self.error = None;
        self.payload = Some(payload.clone());
        self.notify(Ok(payload))
    }

    pub(crate) fn fail(&mut self, error: ChunkError) -> Vec<RequestId> {
        self.error = Some(error.clone());
        self.notify(Err(error))
    }

    pub(crate) fn dispose(&mut self) -> Vec<RequestId> {
        self.payload = None;
        self.notify(Err(ChunkError::Disposed))
    }

    pub(crate) fn pins(&self) -> u32 {
        self.pins
    }

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
    }

    /// Returns the remaining pin count.
    pub(crate) fn unpin(&mut self) -> u32 {
        self.pins = self.pins.saturating_sub(1);
        self.pins
    }

    pub(crate) fn evict_when_unpinned(&self) -> bool {
        self.evict_when_unpinned
    }

    pub(crate) fn defer_eviction(&mut self) {
        self.evict_when_unpinned = true;
    }
}

enum RequestInner {
    Ready(Option<ChunkResult>),
    Pending(oneshot::Receiver<ChunkResult>),
}

/// Future handed out by `fetch_chunk`.
///
/// Resolves with the decoded payload, or with the chunk's error once it has
/// failed permanently or been disposed. Withdrawing the request resolves any
/// still-polled future with [`ChunkError::Cancelled`].
pub struct ChunkRequest {
    id: Option<RequestId>,
    key: ChunkKey,
    inner: RequestInner,
}

impl ChunkRequest {
    pub(crate) fn ready(key: ChunkKey, result: ChunkResult) -> Self {
        Self {
            id: None,
            key,
            inner: RequestInner::Ready(Some(result)),
        }
    }

    pub(crate) fn pending(
        id: RequestId,
        key: ChunkKey,
        rx: oneshot::Receiver<ChunkResult>,
    ) -> Self {
        Self {
            id: Some(id),
            key,
            inner: RequestInner::Pending(rx),
        }
    }

    /// `None` when the request completed synchronously.
    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.inner, RequestInner::Ready(_))
    }
}

impl std::fmt::Debug for ChunkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRequest")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Future for ChunkRequest {
    type Output = ChunkResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            RequestInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(ChunkError::Cancelled)))
            }
            RequestInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // Sender dropped without a result: the request was withdrawn.
                Poll::Ready(Err(_)) => Poll::Ready(Err(ChunkError::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
