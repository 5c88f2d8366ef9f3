// src/config.rs
//! Cache subsystem configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context_ext::Context;
use crate::error::{CacheError, Result};

/// Tunables for the cache subsystem, analogous to `ResourceConfig` for the render
/// resource manager: one struct, a sane [`Default`], optionally overridden from an
/// on-disk file at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheContext {
    /// Byte budget for the memory tier. Exceeding it triggers eviction down to this
    /// limit (subject to the single-entry exemption).
    pub memory_budget_bytes: u64,
    /// Byte budget for the disk tier.
    pub disk_budget_bytes: u64,
    /// Root directory the disk tier stores its cache files under. An inner
    /// `blender_cmpcache` directory is created beneath it. An empty path disables
    /// the disk tier outright, the same as `disk_enabled = false`.
    pub disk_root: PathBuf,
    /// Whether the disk tier is enabled at all. When `false`, disk operations are
    /// no-ops and every disk read is a miss.
    pub disk_enabled: bool,
}

impl Default for CacheContext {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 512 * 1024 * 1024,
            disk_budget_bytes: 4 * 1024 * 1024 * 1024,
            disk_root: std::env::temp_dir().join("comp_cache"),
            disk_enabled: true,
        }
    }
}

impl CacheContext {
    /// Load a context from a JSON or TOML file, falling back to [`Default`] values
    /// for any field the file omits. The format is chosen by the file's extension
    /// (`.json` or `.toml`); anything else is an error.
    pub fn load_override(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config override {}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| CacheError::Config(format!("{}: {e}", path.display()))),
            Some("toml") => toml::from_str(&text)
                .map_err(|e| CacheError::Config(format!("{}: {e}", path.display()))),
            other => Err(CacheError::Config(format!(
                "unsupported config extension {other:?} for {}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_positive_budgets() {
        let ctx = CacheContext::default();
        assert!(ctx.memory_budget_bytes > 0);
        assert!(ctx.disk_budget_bytes > 0);
        assert!(ctx.disk_enabled);
    }

    #[test]
    fn load_override_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.yaml");
        std::fs::write(&path, "memory_budget_bytes: 1").unwrap();
        let err = CacheContext::load_override(&path).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn load_override_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        std::fs::write(&path, r#"{"memory_budget_bytes": 1024}"#).unwrap();
        let ctx = CacheContext::load_override(&path).unwrap();
        assert_eq!(ctx.memory_budget_bytes, 1024);
        assert_eq!(ctx.disk_budget_bytes, CacheContext::default().disk_budget_bytes);
    }
}
