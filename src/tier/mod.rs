// src/tier/mod.rs
//! Shared types and the `CacheTier` capability interface implemented by the memory
//! and disk tiers.
//!
//! Both tiers track entries the same way: a `HashMap<OpKey, _>` for O(1) lookup plus
//! a `BTreeSet<(u64, OpKey)>` ordered by `last_use_time` for O(log n) eviction of the
//! least-recently-used entry. The helpers below keep the two structures in sync;
//! every caller must route updates through them rather than touching either
//! structure directly, or the ordering index silently drifts out of sync with the
//! map.

pub mod disk;
pub mod memory;

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use crate::keys::OpKey;

/// Which phase of graph execution the tier is in. Mirrors the two-phase contract:
/// during `Optimize` the tier only records planned reads; during `Exec` it starts
/// serving reads and prefetching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Optimize,
    Exec,
}

/// Bookkeeping kept per cached entry, independent of where its bytes live.
#[derive(Clone, Copy, Debug)]
pub struct CacheInfo {
    pub op_key: OpKey,
    pub last_use_time: u64,
    pub last_save_time: u64,
}

impl CacheInfo {
    pub fn total_bytes(&self) -> u64 {
        self.op_key.total_bytes()
    }
}

/// A buffer handed back by a tier's `get`. The memory tier shares its canonical
/// buffer cheaply via `Arc`; the disk tier always hands over a fresh allocation it
/// just read from the file.
pub enum CacheBuffer {
    Shared(Arc<[f32]>),
    Owned(Box<[f32]>),
}

impl CacheBuffer {
    pub fn as_slice(&self) -> &[f32] {
        match self {
            CacheBuffer::Shared(buf) => buf,
            CacheBuffer::Owned(buf) => buf,
        }
    }

    pub fn into_vec(self) -> Vec<f32> {
        match self {
            CacheBuffer::Shared(buf) => buf.to_vec(),
            CacheBuffer::Owned(buf) => buf.into_vec(),
        }
    }
}

/// An entry evicted from a tier without being destroyed: its bytes, detached from
/// the tier, handed to the caller so they can re-home it in a lower tier while
/// preserving its original timestamps.
pub struct RemovedCache {
    pub info: CacheInfo,
    pub data: Vec<f32>,
}

/// Shared capability both tiers expose to [`crate::manager::CacheManager`].
pub trait CacheTier {
    /// (Re)initialize the tier. Idempotent; safe to call with the same
    /// configuration repeatedly.
    fn initialize(&mut self, ctx: &crate::config::CacheContext) -> crate::error::Result<()>;

    /// Release any in-flight background work and forget the current planned-read
    /// queue. Does not delete cached entries.
    fn deinitialize(&mut self);

    fn has(&self, key: &OpKey) -> bool;

    fn set_mode(&mut self, mode: Mode);

    /// Record that `key` will be read during the upcoming `Exec` phase. First call
    /// for a given key wins; later duplicate calls are no-ops.
    fn note_planned_read(&mut self, key: OpKey);

    fn delete_all(&mut self) -> crate::error::Result<()>;

    /// `true` if `get` hands back bytes the caller exclusively owns (disk tier);
    /// `false` if it hands back a shared, immutable view (memory tier).
    fn returns_owned_copy(&self) -> bool;
}

/// Insert or move `key` to `new_time` in the ordering index, removing its previous
/// position first if present.
pub(crate) fn touch(
    by_use_time: &mut BTreeSet<(u64, OpKey)>,
    entries: &mut std::collections::HashMap<OpKey, CacheInfo>,
    key: OpKey,
    new_time: u64,
) {
    if let Some(info) = entries.get(&key) {
        by_use_time.remove(&(info.last_use_time, key));
    }
    by_use_time.insert((new_time, key));
}

/// Dedup-insert `key` into the planned-read queue, first-read-wins.
pub(crate) fn note_planned_read_impl(
    planned: &mut VecDeque<OpKey>,
    planned_set: &mut HashSet<OpKey>,
    key: OpKey,
) {
    if planned_set.insert(key) {
        planned.push_back(key);
    }
}
