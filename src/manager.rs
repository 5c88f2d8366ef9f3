// src/manager.rs
//! `CacheManager`: the façade a graph executor talks to. Orchestrates the memory
//! and disk tiers, the persistent-key cross-recompilation map, and the preview /
//! viewer registry behind a single surface.

use std::collections::HashMap;

use crate::config::CacheContext;
use crate::error::Result;
use crate::keys::{OpKey, PersistentKey};
use crate::tier::disk::DiskTier;
use crate::tier::memory::MemoryTier;
use crate::tier::{CacheBuffer, CacheTier, Mode};
use crate::view_registry::ViewRegistry;

/// How a graph node's cache lookup should be dispatched. Most operations are
/// ordinary tiered buffer caches; preview and viewer nodes are cached by a
/// UI-facing identifier instead and go through the [`ViewRegistry`].
#[derive(Clone, Copy, Debug)]
pub enum OpKind {
    Tiered,
    Preview { preview_key: u32 },
    Viewer { image_session_id: u32 },
}

/// The seam between the cache subsystem and the node graph it serves. A real graph
/// node implements this to expose just enough of itself for caching decisions,
/// without the cache needing to know anything else about node operations.
pub trait GraphOp {
    fn op_key(&self) -> OpKey;

    fn kind(&self) -> OpKind {
        OpKind::Tiered
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    fn persistent_key(&self) -> Option<PersistentKey> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

pub struct CacheManager {
    memory: MemoryTier,
    disk: DiskTier,
    view: ViewRegistry,
    persistent_map: HashMap<PersistentKey, OpKey>,
    mode: Mode,
}

impl CacheManager {
    /// `op_type_hash` identifies the kind of buffer this manager caches (every key
    /// it ever sees should carry the same value), used to reconstruct keys from
    /// disk filenames which don't otherwise encode it.
    pub fn new(op_type_hash: u64) -> Self {
        Self {
            memory: MemoryTier::new(),
            disk: DiskTier::new(op_type_hash),
            view: ViewRegistry::new(),
            persistent_map: HashMap::new(),
            mode: Mode::Optimize,
        }
    }

    pub fn initialize(&mut self, ctx: &CacheContext) -> Result<()> {
        self.memory.initialize(ctx)?;
        self.disk.initialize(ctx)?;
        self.view.initialize();
        self.mode = Mode::Optimize;
        Ok(())
    }

    /// `interrupted` should be `true` if the graph run was cancelled partway
    /// through, so the view registry skips pruning previews that simply never got
    /// a chance to run this pass.
    pub fn deinitialize(&mut self, interrupted: bool) {
        self.memory.deinitialize();
        self.disk.deinitialize();
        self.view.deinitialize(interrupted);
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.memory.set_mode(mode);
        self.disk.set_mode(mode);
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_cacheable(&self, op: &dyn GraphOp) -> bool {
        op.is_cacheable()
    }

    pub fn is_cacheable_and_persistent(&self, op: &dyn GraphOp) -> bool {
        op.is_cacheable() && op.persistent_key().is_some()
    }

    /// Look up whether a persistent key has already been mapped to a content hash
    /// from a previous compilation of the graph.
    pub fn check_persistent_op_key(&self, op: &dyn GraphOp) -> (bool, Option<OpKey>) {
        match op.persistent_key().and_then(|pk| self.persistent_map.get(&pk)) {
            Some(fp) => (true, Some(*fp)),
            None => (false, None),
        }
    }

    /// Record the persistent-key → content-hash mapping for a node that was just
    /// compiled, so a later recompilation that produces the same persistent key can
    /// reuse this content hash's cache entry even before recomputing it.
    pub fn register_persistent(&mut self, op: &dyn GraphOp) {
        if let Some(pk) = op.persistent_key() {
            self.persistent_map.insert(pk, op.op_key());
        }
    }

    /// Dispatches by op kind: ordinary tiered lookup for most nodes, the view
    /// registry's own presence check for preview/viewer nodes.
    pub fn has_any_cache(&mut self, op: &dyn GraphOp) -> bool {
        match op.kind() {
            OpKind::Preview { preview_key } => self.view.get_preview(preview_key, op.op_key()).is_some(),
            OpKind::Viewer { image_session_id } => {
                !self.view.viewer_needs_update(image_session_id, op.op_key())
            }
            OpKind::Tiered => self.memory.has(&op.op_key()) || self.disk.has(&op.op_key()),
        }
    }

    /// Record that `key` will be read during the upcoming `Exec` phase. Must be
    /// called for every key a graph plans to read, in the order it plans to read
    /// them, before [`Self::set_mode`] switches to [`Mode::Exec`].
    pub fn note_planned_read(&mut self, key: OpKey) {
        self.memory.note_planned_read(key);
        self.disk.note_planned_read(key);
    }

    /// Plain lookup outside the planned-read protocol (e.g. speculative probes, or
    /// callers that don't participate in prefetching). On a disk hit, promotes the
    /// buffer into the memory tier so a subsequent planned read of the same key
    /// finds it there.
    pub fn get(&mut self, key: OpKey) -> Result<Option<CacheBuffer>> {
        if let Some(buf) = self.memory.get(&key) {
            return Ok(Some(buf));
        }
        if self.disk.has(&key) {
            self.disk.prefetch(&key);
            if let Some(buf) = self.disk.get(&key)? {
                self.memory.save(key, buf.as_slice().to_vec(), 0, 0);
                self.rehome_memory_overflow()?;
                return Ok(Some(buf));
            }
        }
        Ok(None)
    }

    /// Trim the memory tier (without discarding what it evicts) and rehome every
    /// evicted entry into the disk tier, preserving its original timestamps, then
    /// trim the disk tier in turn. Shared by the two upgrade-to-memory paths and by
    /// [`Self::put`].
    fn rehome_memory_overflow(&mut self) -> Result<()> {
        let removed = self.memory.trim_to_budget(false);
        for r in removed {
            self.disk
                .save(r.info.op_key, r.data, None, r.info.last_use_time, r.info.last_save_time)?;
        }
        self.disk.trim_to_budget();
        Ok(())
    }

    /// The `Exec`-phase read: must be called once per planned key, in planned
    /// order. Advances both tiers' prefetch pipelines regardless of which tier (if
    /// any) actually serves the hit, and promotes a disk hit into memory exactly
    /// like [`Self::get`].
    pub fn get_cached_or_new_and_prefetch_next(&mut self, key: OpKey) -> Result<Option<CacheBuffer>> {
        let mem_buf = self.memory.get_and_prefetch_next(&key)?;
        let disk_buf = self.disk.get_and_prefetch_next(&key)?;
        if let Some(buf) = mem_buf {
            return Ok(Some(buf));
        }
        if let Some(buf) = disk_buf {
            self.memory.save(key, buf.as_slice().to_vec(), 0, 0);
            self.rehome_memory_overflow()?;
            return Ok(Some(buf));
        }
        Ok(None)
    }

    /// Save freshly computed output into the memory tier, rehoming anything that
    /// tier evicts as a result down into the disk tier (preserving its original
    /// timestamps), then trim the disk tier in turn.
    pub fn put(&mut self, key: OpKey, data: Vec<f32>) -> Result<()> {
        self.memory.save(key, data, 0, 0);
        self.rehome_memory_overflow()
    }

    pub fn report_preview_write(&mut self, preview_key: u32, op_key: OpKey, buffer: Vec<u8>) -> Result<()> {
        self.view.report_preview_write(preview_key, op_key, buffer)
    }

    pub fn report_viewer_write(&mut self, image_session_id: u32, op_key: OpKey) {
        self.view.report_viewer_write(image_session_id, op_key)
    }

    pub fn view_registry(&self) -> &ViewRegistry {
        &self.view
    }

    pub fn view_registry_mut(&mut self) -> &mut ViewRegistry {
        &mut self.view
    }

    /// Wipe every entry from both tiers and delete the disk tier's on-disk
    /// directory, for operator tooling (`cache-cli clear`) rather than ordinary
    /// graph-execution teardown.
    pub fn clear(&mut self) -> Result<()> {
        self.memory.delete_all()?;
        self.disk.delete_all()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.current_bytes(),
            disk_entries: self.disk.len(),
            disk_bytes: self.disk.current_bytes(),
        }
    }
}
