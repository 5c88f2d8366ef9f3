// src/tier/memory.rs
//! In-memory cache tier: synchronous, shared-ownership, the fast path.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::CacheContext;
use crate::contract_violation;
use crate::error::Result;
use crate::keys::OpKey;
use crate::time::now_ns;

use super::{touch, CacheBuffer, CacheInfo, CacheTier, Mode, RemovedCache};

/// Buffers live entirely in the process's own memory behind an `Arc`, so `get` never
/// blocks and never copies.
#[derive(Default)]
pub struct MemoryTier {
    entries: HashMap<OpKey, CacheInfo>,
    buffers: HashMap<OpKey, Arc<[f32]>>,
    by_use_time: BTreeSet<(u64, OpKey)>,
    planned: VecDeque<OpKey>,
    planned_set: HashSet<OpKey>,
    current_bytes: u64,
    budget: u64,
    mode: Mode,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the buffer cached for `key`. Timestamps of `0` mean "use
    /// now", mirroring `loadCacheInfo`'s behavior for freshly produced data.
    pub fn save(&mut self, key: OpKey, data: Vec<f32>, last_use_time: u64, last_save_time: u64) {
        let last_use_time = if last_use_time == 0 { now_ns() } else { last_use_time };
        let last_save_time = if last_save_time == 0 { now_ns() } else { last_save_time };

        if let Some(old) = self.entries.get(&key) {
            self.current_bytes = self.current_bytes.saturating_sub(old.total_bytes());
        }
        touch(&mut self.by_use_time, &mut self.entries, key, last_use_time);

        let bytes = key.total_bytes();
        self.entries.insert(
            key,
            CacheInfo {
                op_key: key,
                last_use_time,
                last_save_time,
            },
        );
        self.buffers.insert(key, Arc::from(data.into_boxed_slice()));
        self.current_bytes += bytes;
        log::debug!("memory tier save key={key:?} bytes={bytes}");
    }

    /// Insert a buffer without disturbing its original timestamps. Used when
    /// rehoming an entry evicted from a higher tier, or in reverse by a lower tier
    /// promoting an entry back up.
    pub fn adopt(&mut self, info: CacheInfo, data: Vec<f32>) {
        self.save(info.op_key, data, info.last_use_time, info.last_save_time);
    }

    pub fn get(&mut self, key: &OpKey) -> Option<CacheBuffer> {
        let buf = self.buffers.get(key)?.clone();
        let now = now_ns();
        touch(&mut self.by_use_time, &mut self.entries, *key, now);
        if let Some(info) = self.entries.get_mut(key) {
            info.last_use_time = now;
        }
        log::debug!("memory tier hit key={key:?}");
        Some(CacheBuffer::Shared(buf))
    }

    pub fn get_and_prefetch_next(&mut self, key: &OpKey) -> Result<Option<CacheBuffer>> {
        if self.planned.front() != Some(key) {
            return Err(contract_violation!(
                "get_and_prefetch_next called for {key:?} but planned front is {:?}",
                self.planned.front()
            ));
        }
        self.planned.pop_front();
        self.planned_set.remove(key);
        // Memory tier has nothing to prefetch: the buffer is already resident.
        Ok(self.get(key))
    }

    /// Evict least-recently-used entries until `current_bytes <= budget`, exempting
    /// the single remaining entry from eviction (a budget smaller than one entry's
    /// size must not thrash the cache down to zero).
    pub fn trim_to_budget(&mut self, delete: bool) -> Vec<RemovedCache> {
        let mut removed = Vec::new();
        while self.current_bytes > self.budget && self.entries.len() > 1 {
            let Some(&(time, key)) = self.by_use_time.iter().next() else {
                break;
            };
            self.by_use_time.remove(&(time, key));
            let info = self
                .entries
                .remove(&key)
                .expect("by_use_time/entries desynced");
            self.current_bytes = self.current_bytes.saturating_sub(info.total_bytes());
            let buf = self
                .buffers
                .remove(&key)
                .expect("buffers/entries desynced");
            log::debug!("memory tier evict key={key:?} bytes={}", info.total_bytes());
            if !delete {
                removed.push(RemovedCache {
                    info,
                    data: buf.to_vec(),
                });
            }
        }
        removed
    }
}

impl CacheTier for MemoryTier {
    fn initialize(&mut self, ctx: &CacheContext) -> Result<()> {
        self.budget = ctx.memory_budget_bytes;
        self.planned.clear();
        self.planned_set.clear();
        self.mode = Mode::Optimize;
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.planned.clear();
        self.planned_set.clear();
        self.mode = Mode::Optimize;
    }

    fn has(&self, key: &OpKey) -> bool {
        self.entries.contains_key(key)
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn note_planned_read(&mut self, key: OpKey) {
        super::note_planned_read_impl(&mut self.planned, &mut self.planned_set, key);
    }

    fn delete_all(&mut self) -> Result<()> {
        self.entries.clear();
        self.buffers.clear();
        self.by_use_time.clear();
        self.current_bytes = 0;
        Ok(())
    }

    fn returns_owned_copy(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PixelType;

    fn key(n: u64) -> OpKey {
        OpKey::new(1, n, 4, 4, PixelType::Value)
    }

    fn ctx(budget: u64) -> CacheContext {
        CacheContext {
            memory_budget_bytes: budget,
            ..Default::default()
        }
    }

    #[test]
    fn save_then_get_round_trips() {
        let mut tier = MemoryTier::new();
        tier.initialize(&ctx(1_000_000)).unwrap();
        tier.save(key(1), vec![1.0, 2.0, 3.0, 4.0], 0, 0);
        let buf = tier.get(&key(1)).unwrap();
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn miss_returns_none() {
        let mut tier = MemoryTier::new();
        tier.initialize(&ctx(1_000_000)).unwrap();
        assert!(tier.get(&key(1)).is_none());
    }

    #[test]
    fn trim_to_budget_evicts_oldest_first() {
        let mut tier = MemoryTier::new();
        tier.initialize(&ctx(1)).unwrap(); // force eviction on every save beyond 1
        tier.save(key(1), vec![0.0; 4], 10, 10);
        tier.save(key(2), vec![0.0; 4], 20, 20);
        tier.save(key(3), vec![0.0; 4], 30, 30);
        let removed = tier.trim_to_budget(false);
        // key(1) and key(2) evicted in ascending last_use_time order; key(3) stays
        // resident under the single-entry exemption.
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].info.op_key, key(1));
        assert_eq!(removed[1].info.op_key, key(2));
        assert!(tier.has(&key(3)));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn single_entry_exemption_keeps_last_entry_even_over_budget() {
        let mut tier = MemoryTier::new();
        tier.initialize(&ctx(1)).unwrap();
        tier.save(key(1), vec![0.0; 64], 0, 0);
        let removed = tier.trim_to_budget(true);
        assert!(removed.is_empty());
        assert!(tier.has(&key(1)));
    }

    #[test]
    fn get_and_prefetch_next_enforces_planned_order() {
        let mut tier = MemoryTier::new();
        tier.initialize(&ctx(1_000_000)).unwrap();
        tier.save(key(1), vec![0.0; 4], 0, 0);
        tier.save(key(2), vec![0.0; 4], 0, 0);
        tier.set_mode(Mode::Exec);
        let err = tier.get_and_prefetch_next(&key(2)).unwrap_err();
        assert!(err.is_contract_violation());

        tier.note_planned_read(key(1));
        tier.note_planned_read(key(2));
        assert!(tier.get_and_prefetch_next(&key(1)).unwrap().is_some());
        assert!(tier.get_and_prefetch_next(&key(2)).unwrap().is_some());
    }

    #[test]
    fn get_refreshes_recency_so_it_survives_eviction() {
        let mut tier = MemoryTier::new();
        tier.initialize(&ctx(1)).unwrap();
        tier.save(key(1), vec![0.0; 4], 10, 10);
        tier.save(key(2), vec![0.0; 4], 20, 20);
        // touch key(1) so it becomes the most recently used
        tier.get(&key(1));
        tier.save(key(3), vec![0.0; 4], 30, 30);
        let removed = tier.trim_to_budget(true);
        let evicted: Vec<_> = removed.iter().map(|r| r.info.op_key).collect();
        assert!(evicted.contains(&key(2)));
        assert!(!evicted.contains(&key(1)));
    }
}
