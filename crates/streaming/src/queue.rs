use std::collections::HashMap;

use foundation::ObjectId;
use runtime::{CancellationToken, RetryPolicy, SlotBudget, Upsert, WorkQueue, WorkQueueFull};

use crate::request::{ChunkKey, ChunkPriority};

/// A fetch that holds a concurrency slot.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub instance: ObjectId,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Admission control for chunk fetches.
///
/// Queued chunks wait in a priority-indexed `runtime::WorkQueue`; at most
/// `max_inflight` fetches hold a slot at once. The queue manager only does
/// bookkeeping. Starting the actual fetch is the chunk manager's job.
#[derive(Debug)]
pub struct ChunkQueueManager {
    queue: WorkQueue<ChunkKey, ChunkPriority>,
    slots: SlotBudget,
    in_flight: HashMap<ChunkKey, InFlight>,
    retry: RetryPolicy,
}

impl ChunkQueueManager {
    pub fn new(max_inflight: u32, max_queued: usize, retry: RetryPolicy) -> Self {
        Self {
            queue: WorkQueue::with_max_len(max_queued),
            slots: SlotBudget::new(max_inflight),
            in_flight: HashMap::new(),
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: &ChunkKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn queued_priority(&self, key: &ChunkKey) -> Option<ChunkPriority> {
        self.queue.priority_of(key).copied()
    }

    /// Queues `key` or moves it to `priority`. Only new keys can be refused.
    pub fn enqueue(
        &mut self,
        key: ChunkKey,
        priority: ChunkPriority,
    ) -> Result<Upsert, WorkQueueFull> {
        self.queue.try_upsert(key, priority)
    }

    /// Requeues a chunk whose retry delay elapsed, regardless of backpressure.
    pub fn requeue(&mut self, key: ChunkKey, priority: ChunkPriority) {
        self.queue.upsert(key, priority);
    }

    /// Removes a not-yet-admitted chunk.
    pub fn withdraw(&mut self, key: &ChunkKey) -> bool {
        self.queue.remove(key).is_some()
    }

    /// Takes a slot and the best queued chunk, if both are available. The
    /// caller must follow up with [`ChunkQueueManager::start`] or
    /// [`ChunkQueueManager::abandon_admission`].
    pub fn next_admission(&mut self) -> Option<(ChunkKey, ChunkPriority)> {
        if self.queue.is_empty() || !self.slots.try_acquire() {
            return None;
        }
        let next = self.queue.pop_next();
        if next.is_none() {
            self.slots.release();
        }
        next
    }

    pub fn abandon_admission(&mut self) {
        self.slots.release();
    }

    pub fn start(&mut self, key: ChunkKey, flight: InFlight) {
        self.in_flight.insert(key, flight);
    }

    /// Ends the fetch of `instance` and frees its slot. Outcomes for a fetch
    /// that was cancelled, or for an older chunk instance, return `None`.
    pub fn finish(&mut self, key: &ChunkKey, instance: ObjectId) -> Option<InFlight> {
        match self.in_flight.get(key) {
            Some(flight) if flight.instance == instance => {}
            _ => return None,
        }
        let flight = self.in_flight.remove(key)?;
        self.slots.release();
        Some(flight)
    }

    /// Cancels an in-flight fetch and frees its slot right away.
    pub fn cancel(&mut self, key: &ChunkKey) -> bool {
        let Some(flight) = self.in_flight.remove(key) else {
            return false;
        };
        flight.cancel.cancel();
        self.slots.release();
        true
    }
}
