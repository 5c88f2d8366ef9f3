// src/tier/disk.rs
//! On-disk cache tier: one background thread per outstanding save/delete, a single
//! read-ahead slot for prefetching, files named so a directory scan alone can
//! reconstruct every key without a side index.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::base_convert;
use crate::config::CacheContext;
use crate::context_ext::Context;
use crate::contract_violation;
use crate::error::Result;
use crate::keys::{OpKey, PixelType};
use crate::time::now_ns;

use super::{note_planned_read_impl, touch, CacheBuffer, CacheInfo, CacheTier, Mode};

const CACHE_INNER_DIR_NAME: &str = "blender_cmpcache";
const FILENAME_PARTS: usize = 5;

pub struct DiskTier {
    op_type_hash: u64,
    entries: HashMap<OpKey, CacheInfo>,
    by_use_time: BTreeSet<(u64, OpKey)>,
    planned: VecDeque<OpKey>,
    planned_set: HashSet<OpKey>,
    current_bytes: u64,
    budget: u64,
    mode: Mode,
    enabled: bool,
    cache_dir: Option<PathBuf>,

    prefetch_key: Option<OpKey>,
    prefetch_thread: Option<JoinHandle<std::io::Result<Vec<f32>>>>,

    save_threads: HashMap<OpKey, JoinHandle<()>>,
    delete_threads: HashMap<OpKey, JoinHandle<()>>,
    ended_save: Arc<Mutex<HashSet<OpKey>>>,
    ended_delete: Arc<Mutex<HashSet<OpKey>>>,
}

impl DiskTier {
    pub fn new(op_type_hash: u64) -> Self {
        Self {
            op_type_hash,
            entries: HashMap::new(),
            by_use_time: BTreeSet::new(),
            planned: VecDeque::new(),
            planned_set: HashSet::new(),
            current_bytes: 0,
            budget: 0,
            mode: Mode::Optimize,
            enabled: false,
            cache_dir: None,
            prefetch_key: None,
            prefetch_thread: None,
            save_threads: HashMap::new(),
            delete_threads: HashMap::new(),
            ended_save: Arc::new(Mutex::new(HashSet::new())),
            ended_delete: Arc::new(Mutex::new(HashSet::new())),
        }
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

    fn file_path(&self, key: &OpKey, last_save_time: u64) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let name = format!(
            "{}_{}_{}_{}_{}",
            base_convert::encode(key.width as u64, base_convert::MAX_BASE),
            base_convert::encode(key.height as u64, base_convert::MAX_BASE),
            base_convert::encode(key.pixel_type as u64, base_convert::MAX_BASE),
            base_convert::encode(key.content_hash, base_convert::MAX_BASE),
            base_convert::encode(last_save_time, base_convert::MAX_BASE),
        );
        Some(dir.join(name))
    }

    fn parse_filename(op_type_hash: u64, filename: &str) -> Option<(OpKey, u64)> {
        let parts: Vec<&str> = filename.split('_').collect();
        if parts.len() != FILENAME_PARTS {
            return None;
        }
        let width = base_convert::decode(parts[0], base_convert::MAX_BASE)? as u32;
        let height = base_convert::decode(parts[1], base_convert::MAX_BASE)? as u32;
        let pixel_type = match base_convert::decode(parts[2], base_convert::MAX_BASE)? {
            0 => PixelType::Value,
            1 => PixelType::Vector,
            2 => PixelType::Color,
            _ => return None,
        };
        let content_hash = base_convert::decode(parts[3], base_convert::MAX_BASE)?;
        let last_save_time = base_convert::decode(parts[4], base_convert::MAX_BASE)?;
        Some((
            OpKey::new(op_type_hash, content_hash, width, height, pixel_type),
            last_save_time,
        ))
    }

    fn load_cache_info(&mut self, key: OpKey, last_use_time: u64, last_save_time: u64) {
        let last_use_time = if last_use_time == 0 { now_ns() } else { last_use_time };
        touch(&mut self.by_use_time, &mut self.entries, key, last_use_time);
        self.current_bytes += key.total_bytes();
        self.entries.insert(
            key,
            CacheInfo {
                op_key: key,
                last_use_time,
                last_save_time,
            },
        );
    }

    fn load_cache_dir(&mut self) -> Result<()> {
        let Some(dir) = self.cache_dir.clone() else {
            return Ok(());
        };
        let read_dir = std::fs::read_dir(&dir).context("scanning disk cache directory")?;
        for entry in read_dir {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("disk cache: error reading directory entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match Self::parse_filename(self.op_type_hash, filename) {
                Some((key, save_time)) => self.load_cache_info(key, save_time, save_time),
                None => log::warn!("disk cache: ignoring malformed cache filename {filename}"),
            }
        }
        Ok(())
    }

    fn join_all_threads(&mut self) {
        if let Some(handle) = self.prefetch_thread.take() {
            let _ = handle.join();
        }
        self.prefetch_key = None;
        for (_, handle) in self.save_threads.drain() {
            let _ = handle.join();
        }
        for (_, handle) in self.delete_threads.drain() {
            let _ = handle.join();
        }
        self.ended_save.lock().clear();
        self.ended_delete.lock().clear();
    }

    /// Join whatever thread currently touches `key` before starting a new one for
    /// it. Without this, a save racing a not-yet-finished delete for the same key
    /// (or vice versa) could interleave their filesystem operations.
    fn join_related_threads(&mut self, key: &OpKey) {
        if self.prefetch_key.as_ref() == Some(key) {
            if let Some(handle) = self.prefetch_thread.take() {
                let _ = handle.join();
            }
            self.prefetch_key = None;
        }
        if let Some(handle) = self.save_threads.remove(key) {
            let _ = handle.join();
        }
        if let Some(handle) = self.delete_threads.remove(key) {
            let _ = handle.join();
        }
        self.reap_ended_threads();
    }

    fn reap_ended_threads(&mut self) {
        let ended: Vec<OpKey> = self.ended_save.lock().drain().collect();
        for key in ended {
            if let Some(handle) = self.save_threads.remove(&key) {
                let _ = handle.join();
            }
        }
        let ended: Vec<OpKey> = self.ended_delete.lock().drain().collect();
        for key in ended {
            if let Some(handle) = self.delete_threads.remove(&key) {
                let _ = handle.join();
            }
        }
    }

    /// Save a freshly produced buffer. `last_use_time`/`last_save_time` of `0` mean
    /// "use now"; non-zero values are given when rehoming a buffer evicted from a
    /// higher tier, to preserve its original recency.
    pub fn save(
        &mut self,
        key: OpKey,
        data: Vec<f32>,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
        last_use_time: u64,
        last_save_time: u64,
    ) -> Result<()> {
        if self.cache_dir.is_none() {
            return Ok(());
        }
        self.join_related_threads(&key);

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
        self.current_bytes += bytes;

        let Some(path) = self.file_path(&key, last_save_time) else {
            return Ok(());
        };
        let ended = Arc::clone(&self.ended_save);
        let handle = thread::spawn(move || {
            let write_result = std::fs::write(&path, bytemuck::cast_slice::<f32, u8>(&data));
            if let Err(e) = write_result {
                log::warn!("disk cache: failed writing {}: {e}", path.display());
            }
            if let Some(cb) = on_complete {
                cb();
            }
            ended.lock().insert(key);
        });
        self.save_threads.insert(key, handle);
        log::debug!("disk cache save scheduled key={key:?} bytes={bytes}");
        Ok(())
    }

    /// Kick off (or restart) an async read of `key`'s file. A no-op if the key has
    /// no entry or the tier has no working directory.
    pub fn prefetch(&mut self, key: &OpKey) {
        if self.cache_dir.is_none() || !self.entries.contains_key(key) {
            return;
        }
        self.join_related_threads(key);
        let info = *self.entries.get(key).expect("checked contains_key above");
        let Some(path) = self.file_path(key, info.last_save_time) else {
            return;
        };
        let handle = thread::spawn(move || -> std::io::Result<Vec<f32>> {
            let bytes = std::fs::read(&path)?;
            // `bytes` comes from a fresh `Vec<u8>` with no alignment guarantee;
            // `pod_collect_to_vec` copies element-wise instead of reinterpreting the
            // allocation in place, so a misaligned read can't panic.
            Ok(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes))
        });
        self.prefetch_thread = Some(handle);
        self.prefetch_key = Some(*key);
    }

    /// Retrieve `key`'s buffer. Per the original contract, this only ever serves
    /// whatever is currently prefetched: a `get` for a key that wasn't just
    /// prefetched is a miss, even if the file exists on disk (the caller is
    /// expected to call [`Self::prefetch`] first — see `CacheManager::get`'s
    /// synchronous prefetch-then-get fallback for the one place that does this on
    /// a caller's behalf).
    pub fn get(&mut self, key: &OpKey) -> Result<Option<CacheBuffer>> {
        if self.cache_dir.is_none() {
            return Ok(None);
        }
        if self.prefetch_key.as_ref() != Some(key) {
            // Stale or unrelated prefetch: join it and drop the buffer it produced
            // rather than leaving it dangling for a later, unrelated `get`.
            if let Some(handle) = self.prefetch_thread.take() {
                let _ = handle.join();
            }
            self.prefetch_key = None;
            return Ok(None);
        }
        let handle = self
            .prefetch_thread
            .take()
            .expect("prefetch_key set implies a prefetch thread is present");
        self.prefetch_key = None;
        match handle.join() {
            Ok(Ok(data)) => {
                let now = now_ns();
                touch(&mut self.by_use_time, &mut self.entries, *key, now);
                if let Some(info) = self.entries.get_mut(key) {
                    info.last_use_time = now;
                }
                log::debug!("disk cache hit key={key:?}");
                Ok(Some(CacheBuffer::Owned(data.into_boxed_slice())))
            }
            Ok(Err(e)) => {
                log::warn!("disk cache: prefetch read failed for {key:?}: {e}");
                Ok(None)
            }
            Err(_) => {
                log::error!("disk cache: prefetch thread panicked for {key:?}");
                Ok(None)
            }
        }
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
        let result = self.get(key)?;
        if let Some(next) = self.planned.front().copied() {
            self.prefetch(&next);
        }
        Ok(result)
    }

    fn delete(&mut self, key: &OpKey) {
        let Some(info) = self.entries.remove(key) else {
            return;
        };
        self.by_use_time.remove(&(info.last_use_time, *key));
        self.current_bytes = self.current_bytes.saturating_sub(info.total_bytes());
        let Some(path) = self.file_path(key, info.last_save_time) else {
            return;
        };
        self.join_related_threads(key);
        let ended = Arc::clone(&self.ended_delete);
        let key_copy = *key;
        let handle = thread::spawn(move || {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("disk cache: failed deleting {}: {e}", path.display());
            }
            ended.lock().insert(key_copy);
        });
        self.delete_threads.insert(*key, handle);
    }

    /// Evict least-recently-used entries until under budget, exempting the single
    /// remaining entry. Unlike the memory tier, the disk tier is the last tier:
    /// there is nowhere to rehome an evicted entry, so eviction always deletes.
    pub fn trim_to_budget(&mut self) {
        while self.current_bytes > self.budget && self.entries.len() > 1 {
            let Some(&(_, key)) = self.by_use_time.iter().next() else {
                break;
            };
            self.delete(&key);
        }
    }
}

impl CacheTier for DiskTier {
    fn initialize(&mut self, ctx: &CacheContext) -> Result<()> {
        self.budget = ctx.disk_budget_bytes;
        self.planned.clear();
        self.planned_set.clear();
        self.mode = Mode::Optimize;

        if !ctx.disk_enabled || ctx.disk_root.as_os_str().is_empty() {
            self.delete_all()?;
            self.enabled = false;
            return Ok(());
        }
        self.enabled = true;

        let candidate = ctx.disk_root.join(CACHE_INNER_DIR_NAME);
        if self.cache_dir.as_deref() == Some(candidate.as_path()) {
            return Ok(());
        }

        // Root changed (or first run): tear down whatever we pointed at before.
        self.delete_all()?;

        match std::fs::create_dir_all(&candidate) {
            Ok(()) => {
                self.cache_dir = Some(candidate);
                self.load_cache_dir()?;
            }
            Err(e) => {
                log::warn!(
                    "disk cache: failed to create cache directory {}: {e}",
                    candidate.display()
                );
                self.cache_dir = None;
            }
        }
        Ok(())
    }

    fn deinitialize(&mut self) {
        // Only the in-flight prefetch is joined here; outstanding save/delete
        // threads are left running in the background and reaped on the next
        // `initialize`/`delete_all`, matching how this tier never blocks graph
        // teardown on pending writes.
        if let Some(handle) = self.prefetch_thread.take() {
            let _ = handle.join();
        }
        self.prefetch_key = None;
        self.planned.clear();
        self.planned_set.clear();
        self.mode = Mode::Optimize;
    }

    fn has(&self, key: &OpKey) -> bool {
        self.entries.contains_key(key)
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        if mode == Mode::Exec {
            if let Some(key) = self.planned.front().copied() {
                self.prefetch(&key);
            }
        }
    }

    fn note_planned_read(&mut self, key: OpKey) {
        note_planned_read_impl(&mut self.planned, &mut self.planned_set, key);
    }

    fn delete_all(&mut self) -> Result<()> {
        self.join_all_threads();
        self.entries.clear();
        self.by_use_time.clear();
        self.current_bytes = 0;
        if let Some(dir) = self.cache_dir.take() {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    log::warn!("disk cache: failed removing cache directory {}: {e}", dir.display());
                }
            }
        }
        Ok(())
    }

    fn returns_owned_copy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> OpKey {
        OpKey::new(7, n, 4, 4, PixelType::Value)
    }

    fn ctx(dir: &std::path::Path, budget: u64) -> CacheContext {
        CacheContext {
            disk_budget_bytes: budget,
            disk_root: dir.to_path_buf(),
            disk_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn save_prefetch_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::new(7);
        tier.initialize(&ctx(dir.path(), 1_000_000)).unwrap();
        tier.save(key(1), vec![1.0, 2.0, 3.0, 4.0], None, 0, 0).unwrap();
        // join the in-flight write before reading it back
        tier.join_related_threads(&key(1));

        tier.prefetch(&key(1));
        let buf = tier.get(&key(1)).unwrap().unwrap();
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn get_without_matching_prefetch_misses() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::new(7);
        tier.initialize(&ctx(dir.path(), 1_000_000)).unwrap();
        tier.save(key(1), vec![0.0; 4], None, 0, 0).unwrap();
        tier.join_related_threads(&key(1));
        assert!(tier.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn get_for_mismatched_key_joins_and_drops_the_stale_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::new(7);
        tier.initialize(&ctx(dir.path(), 1_000_000)).unwrap();
        tier.save(key(1), vec![0.0; 4], None, 0, 0).unwrap();
        tier.join_related_threads(&key(1));

        // prefetch key(1), but ask get() for an unrelated key(2): the stale
        // prefetch must be joined and forgotten, not left dangling.
        tier.prefetch(&key(1));
        assert!(tier.get(&key(2)).unwrap().is_none());
        assert!(tier.prefetch_thread.is_none());
        assert!(tier.prefetch_key.is_none());

        // the tier is left usable: a fresh prefetch of key(1) still succeeds.
        tier.prefetch(&key(1));
        let buf = tier.get(&key(1)).unwrap().unwrap();
        assert_eq!(buf.as_slice(), &[0.0f32; 4][..]);
    }

    #[test]
    fn reinitializing_at_a_new_root_discards_old_directory() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::new(7);
        tier.initialize(&ctx(dir_a.path(), 1_000_000)).unwrap();
        tier.save(key(1), vec![0.0; 4], None, 0, 0).unwrap();
        tier.join_related_threads(&key(1));
        let old_inner = dir_a.path().join(CACHE_INNER_DIR_NAME);
        assert!(old_inner.exists());

        tier.initialize(&ctx(dir_b.path(), 1_000_000)).unwrap();
        assert!(!old_inner.exists());
        assert!(!tier.has(&key(1)));
    }

    #[test]
    fn directory_scan_reconstructs_entries_on_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tier = DiskTier::new(7);
            tier.initialize(&ctx(dir.path(), 1_000_000)).unwrap();
            tier.save(key(1), vec![0.0; 4], None, 0, 0).unwrap();
            tier.join_related_threads(&key(1));
        }
        let mut tier2 = DiskTier::new(7);
        tier2.initialize(&ctx(dir.path(), 1_000_000)).unwrap();
        assert!(tier2.has(&key(1)));
    }

    #[test]
    fn disabled_tier_is_always_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::new(7);
        let mut c = ctx(dir.path(), 1_000_000);
        c.disk_enabled = false;
        tier.initialize(&c).unwrap();
        tier.save(key(1), vec![0.0; 4], None, 0, 0).unwrap();
        assert!(!tier.has(&key(1)));
    }

    #[test]
    fn empty_root_disables_tier_without_creating_a_directory() {
        let mut tier = DiskTier::new(7);
        let mut c = ctx(std::path::Path::new(""), 1_000_000);
        c.disk_root = std::path::PathBuf::new();
        tier.initialize(&c).unwrap();
        tier.save(key(1), vec![0.0; 4], None, 0, 0).unwrap();
        assert!(!tier.has(&key(1)));
        assert!(tier.get(&key(1)).unwrap().is_none());
        assert!(!std::path::Path::new("blender_cmpcache").exists());
    }

    #[test]
    fn malformed_filenames_are_skipped_during_scan() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join(CACHE_INNER_DIR_NAME);
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::write(inner.join("not_a_cache_file"), b"garbage").unwrap();
        let mut tier = DiskTier::new(7);
        tier.initialize(&ctx(dir.path(), 1_000_000)).unwrap();
        assert!(tier.is_empty());
    }
}
