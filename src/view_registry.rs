// src/view_registry.rs
//! Preview and viewer caches: small, independent from the tiered buffer cache,
//! keyed by UI-facing identifiers rather than content hashes.

use std::collections::{HashMap, HashSet};

use crate::error::{CacheError, Result};
use crate::keys::OpKey;

/// Tracks what a preview panel and the interactive viewer currently show, so the
/// graph executor can skip recomputing a preview/viewer output that hasn't changed.
#[derive(Default)]
pub struct ViewRegistry {
    previews: HashMap<u32, (OpKey, Vec<u8>)>,
    viewers: HashMap<u32, OpKey>,
    exercised: HashSet<u32>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called at the start of a graph run.
    pub fn initialize(&mut self) {
        self.exercised.clear();
    }

    /// Called at the end of a graph run. When the run completed normally (not
    /// interrupted), previews that were never looked at this run are pruned —
    /// their owning preview panel was closed or replaced. When the run was
    /// interrupted, pruning is skipped so a panel isn't blanked just because its
    /// refresh never got to run.
    pub fn deinitialize(&mut self, interrupted: bool) {
        if !interrupted {
            let exercised = &self.exercised;
            self.previews.retain(|k, _| exercised.contains(k));
        }
        self.exercised.clear();
    }

    /// Look up a preview's buffer, marking `preview_key` as exercised regardless of
    /// outcome. On a stale hit (the preview panel now wants a different key), the
    /// stale entry is dropped so a later [`Self::report_preview_write`] for the new
    /// key doesn't collide with leftover state.
    pub fn get_preview(&mut self, preview_key: u32, op_key: OpKey) -> Option<&[u8]> {
        self.exercised.insert(preview_key);
        let hit = matches!(self.previews.get(&preview_key), Some((fp, _)) if *fp == op_key);
        if hit {
            self.previews.get(&preview_key).map(|(_, buf)| buf.as_slice())
        } else {
            self.previews.remove(&preview_key);
            None
        }
    }

    pub fn has_preview(&self, preview_key: u32, op_key: OpKey) -> bool {
        matches!(self.previews.get(&preview_key), Some((fp, _)) if *fp == op_key)
    }

    /// Record a freshly rendered preview. Fails if `preview_key` is still occupied —
    /// callers must always resolve a miss (via [`Self::get_preview`] returning
    /// `None`) before writing, so a double-write indicates a caller bug.
    pub fn report_preview_write(&mut self, preview_key: u32, op_key: OpKey, buffer: Vec<u8>) -> Result<()> {
        if self.previews.contains_key(&preview_key) {
            return Err(CacheError::contract(format!(
                "preview_key {preview_key} already has a cached buffer"
            )));
        }
        self.previews.insert(preview_key, (op_key, buffer));
        Ok(())
    }

    /// `true` if the viewer identified by `image_session_id` needs to be
    /// recomputed because it isn't already showing `op_key`.
    pub fn viewer_needs_update(&self, image_session_id: u32, op_key: OpKey) -> bool {
        self.viewers.get(&image_session_id) != Some(&op_key)
    }

    pub fn report_viewer_write(&mut self, image_session_id: u32, op_key: OpKey) {
        self.viewers.insert(image_session_id, op_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PixelType;

    fn key(n: u64) -> OpKey {
        OpKey::new(1, n, 4, 4, PixelType::Color)
    }

    #[test]
    fn preview_miss_then_write_then_hit() {
        let mut reg = ViewRegistry::new();
        assert!(reg.get_preview(1, key(1)).is_none());
        reg.report_preview_write(1, key(1), vec![1, 2, 3]).unwrap();
        assert_eq!(reg.get_preview(1, key(1)), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn stale_preview_is_dropped_and_rewritable() {
        let mut reg = ViewRegistry::new();
        reg.report_preview_write(1, key(1), vec![9]).unwrap();
        // requesting a different op_key for the same preview_key is a miss, and
        // clears the stale entry
        assert!(reg.get_preview(1, key(2)).is_none());
        reg.report_preview_write(1, key(2), vec![7]).unwrap();
        assert_eq!(reg.get_preview(1, key(2)), Some(&[7u8][..]));
    }

    #[test]
    fn double_write_without_intervening_miss_is_a_contract_violation() {
        let mut reg = ViewRegistry::new();
        reg.report_preview_write(1, key(1), vec![1]).unwrap();
        let err = reg.report_preview_write(1, key(1), vec![2]).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn deinitialize_prunes_unexercised_previews_unless_interrupted() {
        let mut reg = ViewRegistry::new();
        reg.initialize();
        reg.report_preview_write(1, key(1), vec![1]).unwrap();
        reg.report_preview_write(2, key(2), vec![2]).unwrap();
        reg.get_preview(1, key(1)); // exercise only preview_key 1

        reg.deinitialize(false);
        assert!(reg.has_preview(1, key(1)));
        assert!(!reg.has_preview(2, key(2)));
    }

    #[test]
    fn interrupted_deinitialize_keeps_unexercised_previews() {
        let mut reg = ViewRegistry::new();
        reg.initialize();
        reg.report_preview_write(1, key(1), vec![1]).unwrap();
        reg.deinitialize(true);
        assert!(reg.has_preview(1, key(1)));
    }

    #[test]
    fn viewer_needs_update_reflects_last_write() {
        let mut reg = ViewRegistry::new();
        assert!(reg.viewer_needs_update(5, key(1)));
        reg.report_viewer_write(5, key(1));
        assert!(!reg.viewer_needs_update(5, key(1)));
        assert!(reg.viewer_needs_update(5, key(2)));
    }
}
