use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Indexed priority queue for admission scheduling.
///
/// Key properties:
/// - Greater priority runs earlier; equal priorities go to the most recent
///   insertion or update.
/// - Each key is queued at most once. Re-submitting a queued key updates its
///   priority in place in `O(log n)`.
/// - Removal by key does not perturb the order of remaining items.
/// - Optional backpressure via a maximum pending length.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkQueueFull {
    pub max_len: usize,
}

impl std::fmt::Display for WorkQueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "work queue full (max_len={})", self.max_len)
    }
}

impl std::error::Error for WorkQueueFull {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

// Ordered by `(priority, seq)`; the greatest slot is the next to run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Slot<P> {
    priority: P,
    seq: u64,
}

#[derive(Debug)]
pub struct WorkQueue<K, P> {
    next_seq: u64,
    order: BTreeMap<Slot<P>, K>,
    index: HashMap<K, Slot<P>>,
    max_len: Option<usize>,
}

impl<K, P> Default for WorkQueue<K, P> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            order: BTreeMap::new(),
            index: HashMap::new(),
            max_len: None,
        }
    }
}

impl<K, P> WorkQueue<K, P>
where
    K: Eq + Hash + Clone,
    P: Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
            ..Self::default()
        }
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn priority_of(&self, key: &K) -> Option<&P> {
        self.index.get(key).map(|slot| &slot.priority)
    }

    /// Inserts `key`, or moves it to `priority` if already queued.
    ///
    /// Updates never fail; only new keys are subject to backpressure.
    pub fn try_upsert(&mut self, key: K, priority: P) -> Result<Upsert, WorkQueueFull> {
        let outcome = match self.index.get(&key) {
            Some(old) => {
                let old = old.clone();
                self.order.remove(&old);
                Upsert::Updated
            }
            None => {
                if let Some(max_len) = self.max_len
                    && self.index.len() >= max_len
                {
                    return Err(WorkQueueFull { max_len });
                }
                Upsert::Inserted
            }
        };

        let slot = Slot {
            priority,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        self.order.insert(slot.clone(), key.clone());
        self.index.insert(key, slot);
        Ok(outcome)
    }

    /// Like [`WorkQueue::try_upsert`] but ignores the length limit, for work
    /// that was already admitted once (retries).
    pub fn upsert(&mut self, key: K, priority: P) -> Upsert {
        let max_len = self.max_len.take();
        let outcome = self.try_upsert(key, priority);
        self.max_len = max_len;
        outcome.unwrap_or(Upsert::Inserted)
    }

    pub fn remove(&mut self, key: &K) -> Option<P> {
        let slot = self.index.remove(key)?;
        self.order.remove(&slot);
        Some(slot.priority)
    }

    /// Pops the highest priority (then most recent) item.
    pub fn pop_next(&mut self) -> Option<(K, P)> {
        let (slot, key) = self.order.pop_last()?;
        self.index.remove(&key);
        Some((key, slot.priority))
    }

    pub fn peek_next(&self) -> Option<(&K, &P)> {
        self.order
            .last_key_value()
            .map(|(slot, key)| (key, &slot.priority))
    }

    /// Items in admission order, best first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &P)> {
        self.order
            .iter()
            .rev()
            .map(|(slot, key)| (key, &slot.priority))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Upsert, WorkQueue, WorkQueueFull};

    #[test]
    fn same_priority_prefers_most_recent() {
        let mut q = WorkQueue::new();
        q.try_upsert("a", 0).unwrap();
        q.try_upsert("b", 0).unwrap();
        q.try_upsert("c", 0).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| q.pop_next().map(|(k, _)| k)).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn higher_priority_runs_first() {
        let mut q = WorkQueue::new();
        q.try_upsert("late", -1).unwrap();
        q.try_upsert("early", 10).unwrap();
        q.try_upsert("middle", 3).unwrap();
        assert_eq!(q.peek_next(), Some((&"early", &10)));
        let order: Vec<_> = q.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn upsert_reprioritizes_in_place() {
        let mut q = WorkQueue::new();
        assert_eq!(q.try_upsert("a", 1), Ok(Upsert::Inserted));
        q.try_upsert("b", 5).unwrap();
        assert_eq!(q.try_upsert("a", 9), Ok(Upsert::Updated));
        assert_eq!(q.len(), 2);
        assert_eq!(q.priority_of(&"a"), Some(&9));
        assert_eq!(q.pop_next(), Some(("a", 9)));
        assert_eq!(q.pop_next(), Some(("b", 5)));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_skips_item() {
        let mut q = WorkQueue::new();
        q.try_upsert("a", 0).unwrap();
        q.try_upsert("b", 1).unwrap();
        assert_eq!(q.remove(&"b"), Some(1));
        assert_eq!(q.remove(&"b"), None);
        assert_eq!(q.pop_next(), Some(("a", 0)));
        assert!(q.pop_next().is_none());
    }

    #[test]
    fn backpressure_rejects_new_keys_only() {
        let mut q = WorkQueue::with_max_len(2);
        assert!(q.try_upsert("a", 0).is_ok());
        assert!(q.try_upsert("b", 0).is_ok());

        let err = q.try_upsert("c", 0).unwrap_err();
        assert_eq!(err, WorkQueueFull { max_len: 2 });
        assert_eq!(q.try_upsert("a", 4), Ok(Upsert::Updated));
    }

    #[test]
    fn unchecked_upsert_ignores_limit() {
        let mut q = WorkQueue::with_max_len(1);
        q.try_upsert("a", 0).unwrap();
        assert_eq!(q.upsert("retry", 1), Upsert::Inserted);
        assert_eq!(q.len(), 2);
        assert_eq!(q.max_len(), Some(1));
        assert!(q.try_upsert("c", 0).is_err());
    }
}
