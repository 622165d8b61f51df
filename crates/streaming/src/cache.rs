use std::collections::BTreeMap;

use crate::request::ChunkKey;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBudget {
    pub max_bytes: usize,
}

impl MemoryBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: usize,
    last_used_tick: u64,
    pin_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("chunk of {requested} bytes exceeds the {max} byte budget")]
    BudgetExceeded { requested: usize, max: usize },
    #[error("chunk is not resident")]
    UnknownKey,
}

/// Byte accounting for chunks held in system memory.
///
/// Notes on determinism:
/// - Entries are keyed in a `BTreeMap` for stable traversal order.
/// - Eviction is LRU by `last_used_tick`, with a tie-break by key ordering.
/// - Pinned entries are never chosen. If everything left is pinned the cache
///   stays over budget until something is unpinned.
#[derive(Debug)]
pub struct ResidencyCache {
    budget: MemoryBudget,
    used_bytes: usize,
    tick: u64,
    entries: BTreeMap<ChunkKey, CacheEntry>,
}

impl ResidencyCache {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            budget,
            used_bytes: 0,
            tick: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn is_over_budget(&self) -> bool {
        self.used_bytes > self.budget.max_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn touch(&mut self, key: &ChunkKey) -> Result<(), CacheError> {
        self.tick += 1;
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;
        entry.last_used_tick = self.tick;
        Ok(())
    }

    pub fn pin(&mut self, key: &ChunkKey) -> Result<(), CacheError> {
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;
        entry.pin_count = entry.pin_count.saturating_add(1);
        Ok(())
    }

    /// Unpinning may make room; returns whatever had to be evicted.
    pub fn unpin(&mut self, key: &ChunkKey) -> Result<Vec<ChunkKey>, CacheError> {
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;
        entry.pin_count = entry.pin_count.saturating_sub(1);
        Ok(self.evict_as_needed(None))
    }

    /// Records `key` as resident and evicts least recently used entries until
    /// the budget holds again. The new entry itself is evicted only when
    /// everything else is pinned.
    pub fn mark_resident(
        &mut self,
        key: &ChunkKey,
        bytes: usize,
    ) -> Result<Vec<ChunkKey>, CacheError> {
        if bytes > self.budget.max_bytes {
            return Err(CacheError::BudgetExceeded {
                requested: bytes,
                max: self.budget.max_bytes,
            });
        }

        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.entry(key.clone()).or_insert(CacheEntry {
            bytes: 0,
            last_used_tick: tick,
            pin_count: 0,
        });
        self.used_bytes = self.used_bytes.saturating_sub(entry.bytes);
        entry.bytes = bytes;
        entry.last_used_tick = tick;
        self.used_bytes += bytes;

        Ok(self.evict_as_needed(Some(key)))
    }

    /// Forgets `key`, returning the bytes it held.
    pub fn remove(&mut self, key: &ChunkKey) -> Option<usize> {
        let entry = self.entries.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(entry.bytes);
        Some(entry.bytes)
    }

    fn evict_as_needed(&mut self, protected: Option<&ChunkKey>) -> Vec<ChunkKey> {
        let mut evicted: Vec<ChunkKey> = Vec::new();
        while self.is_over_budget() {
            let pick = |exclude: Option<&ChunkKey>| {
                self.entries
                    .iter()
                    .filter(|(k, e)| e.pin_count == 0 && exclude.map(|p| p != *k).unwrap_or(true))
                    .min_by(|(ka, ea), (kb, eb)| {
                        ea.last_used_tick
                            .cmp(&eb.last_used_tick)
                            .then_with(|| ka.cmp(kb))
                    })
                    .map(|(k, _)| k.clone())
            };

            let Some(key) = pick(protected).or_else(|| pick(None)) else {
                break;
            };
            self.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheError, MemoryBudget, ResidencyCache};
    use crate::request::{ChunkKey, SourceId};

    fn key(x: i64) -> ChunkKey {
        ChunkKey::new(SourceId(1), vec![x])
    }

    #[test]
    fn lru_eviction_is_deterministic() {
        let mut cache = ResidencyCache::new(MemoryBudget::new(10));
        assert_eq!(cache.mark_resident(&key(0), 6), Ok(vec![]));
        assert_eq!(cache.mark_resident(&key(1), 6), Ok(vec![key(0)]));
        assert!(cache.contains(&key(1)));
        assert!(cache.used_bytes() <= cache.budget().max_bytes);
    }

    #[test]
    fn touch_refreshes_recency() {
        let mut cache = ResidencyCache::new(MemoryBudget::new(12));
        cache.mark_resident(&key(0), 4).unwrap();
        cache.mark_resident(&key(1), 4).unwrap();
        cache.touch(&key(0)).unwrap();
        assert_eq!(cache.mark_resident(&key(2), 8), Ok(vec![key(1)]));
    }

    #[test]
    fn pinned_entries_are_not_evicted() {
        let mut cache = ResidencyCache::new(MemoryBudget::new(10));
        cache.mark_resident(&key(0), 6).unwrap();
        cache.pin(&key(0)).unwrap();

        // Everything else is pinned, so the newcomer goes.
        assert_eq!(cache.mark_resident(&key(1), 6), Ok(vec![key(1)]));
        assert!(cache.contains(&key(0)));
        assert_eq!(cache.used_bytes(), 6);
    }

    #[test]
    fn unpin_releases_pressure() {
        let mut cache = ResidencyCache::new(MemoryBudget::new(10));
        cache.mark_resident(&key(0), 6).unwrap();
        cache.mark_resident(&key(1), 4).unwrap();
        cache.pin(&key(0)).unwrap();
        cache.pin(&key(1)).unwrap();
        // Both pinned: the newcomer is the only candidate.
        assert_eq!(cache.mark_resident(&key(2), 1), Ok(vec![key(2)]));

        assert_eq!(cache.unpin(&key(0)), Ok(vec![]));
        assert_eq!(cache.mark_resident(&key(3), 2), Ok(vec![key(0)]));
        assert_eq!(cache.used_bytes(), 6);
        assert_eq!(cache.unpin(&key(9)), Err(CacheError::UnknownKey));
    }

    #[test]
    fn oversized_chunks_are_rejected() {
        let mut cache = ResidencyCache::new(MemoryBudget::new(10));
        assert_eq!(
            cache.mark_resident(&key(0), 11),
            Err(CacheError::BudgetExceeded {
                requested: 11,
                max: 10
            })
        );
        assert!(cache.is_empty());
    }
}
